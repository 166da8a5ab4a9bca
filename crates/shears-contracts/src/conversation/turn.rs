use std::fmt;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::errors::{GenerationError, GenerationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
    Gif,
}

impl ImageFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let lowered = mime.trim().to_ascii_lowercase();
        if lowered.contains("png") {
            return Some(Self::Png);
        }
        if lowered.contains("jpeg") || lowered.contains("jpg") {
            return Some(Self::Jpeg);
        }
        if lowered.contains("webp") {
            return Some(Self::Webp);
        }
        if lowered.contains("gif") {
            return Some(Self::Gif);
        }
        None
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim().to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Gif => "image/gif",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
            Self::Gif => "gif",
        }
    }
}

/// Encoded image bytes plus their declared format.
///
/// Payloads are immutable once built; normalization produces a new payload
/// instead of editing one in place.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
    format: ImageFormat,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, format: ImageFormat) -> Self {
        Self { bytes, format }
    }

    /// Loads an upload from disk, trusting the file extension for the format.
    pub fn from_path(path: &Path) -> GenerationResult<Self> {
        let format = path
            .extension()
            .and_then(|value| value.to_str())
            .and_then(ImageFormat::from_extension)
            .ok_or_else(|| {
                GenerationError::invalid(format!(
                    "unsupported image type: {} (expected png, jpg, jpeg, webp or gif)",
                    path.display()
                ))
            })?;
        let bytes = std::fs::read(path).map_err(|err| {
            GenerationError::invalid(format!("failed reading {}: {err}", path.display()))
        })?;
        if bytes.is_empty() {
            return Err(GenerationError::invalid(format!(
                "image file is empty: {}",
                path.display()
            )));
        }
        Ok(Self::new(bytes, format))
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, &self.bytes)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("format", &self.format)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    role: Role,
    text: Option<String>,
    images: Vec<ImagePayload>,
}

impl Turn {
    /// Builds a turn; whitespace-only text counts as absent and a turn must
    /// carry text or at least one image.
    pub fn new(role: Role, text: Option<String>, images: Vec<ImagePayload>) -> GenerationResult<Self> {
        let text = text.filter(|value| !value.trim().is_empty());
        if text.is_none() && images.is_empty() {
            return Err(GenerationError::invalid(format!(
                "{role} turn needs text or at least one image"
            )));
        }
        Ok(Self { role, text, images })
    }

    pub fn user(text: Option<String>, images: Vec<ImagePayload>) -> GenerationResult<Self> {
        Self::new(Role::User, text, images)
    }

    pub fn assistant_text(text: impl Into<String>) -> GenerationResult<Self> {
        Self::new(Role::Assistant, Some(text.into()), Vec::new())
    }

    pub fn assistant_image(image: ImagePayload) -> Self {
        Self {
            role: Role::Assistant,
            text: None,
            images: vec![image],
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn images(&self) -> &[ImagePayload] {
        &self.images
    }
}
