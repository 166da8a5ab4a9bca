use serde::{Deserialize, Serialize};

use crate::conversation::{ImagePayload, Turn};
use crate::errors::{GenerationError, GenerationResult};

/// Optional behaviors of a generation session. All on by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationFeatures {
    pub resize: bool,
    pub refine: bool,
    pub regenerate: bool,
}

impl Default for GenerationFeatures {
    fn default() -> Self {
        Self {
            resize: true,
            refine: true,
            regenerate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GenerationRequest {
    pub prompt_text: Option<String>,
    pub input_images: Vec<ImagePayload>,
    pub sampling_temperature: Option<f32>,
}

impl GenerationRequest {
    pub fn new(prompt_text: Option<String>, input_images: Vec<ImagePayload>) -> Self {
        Self {
            prompt_text: prompt_text.filter(|value| !value.trim().is_empty()),
            input_images,
            sampling_temperature: None,
        }
    }

    pub fn text(prompt: impl Into<String>) -> Self {
        Self::new(Some(prompt.into()), Vec::new())
    }

    /// A refine request: exactly the prior image plus the new instruction.
    pub fn refinement(prior_image: ImagePayload, instruction: impl Into<String>) -> Self {
        Self::new(Some(instruction.into()), vec![prior_image])
    }

    pub fn with_image(mut self, image: ImagePayload) -> Self {
        self.input_images.push(image);
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.sampling_temperature = temperature;
        self
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt_text
            .as_deref()
            .filter(|value| !value.trim().is_empty())
    }

    pub fn validate(&self) -> GenerationResult<()> {
        if self.prompt().is_none() && self.input_images.is_empty() {
            return Err(GenerationError::invalid(
                "a request needs prompt text or at least one image",
            ));
        }
        if let Some(temperature) = self.sampling_temperature {
            if !temperature.is_finite() || temperature < 0.0 {
                return Err(GenerationError::invalid(format!(
                    "sampling temperature must be a non-negative number, got {temperature}"
                )));
            }
        }
        Ok(())
    }

    /// The user turn this request would add to the transcript.
    pub fn user_turn(&self) -> GenerationResult<Turn> {
        Turn::user(
            self.prompt().map(str::to_string),
            self.input_images.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationResponsePart {
    Text(String),
    Image(ImagePayload),
}

impl GenerationResponsePart {
    pub fn into_turn(self) -> GenerationResult<Turn> {
        match self {
            Self::Text(text) => Turn::assistant_text(text),
            Self::Image(image) => Ok(Turn::assistant_image(image)),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImagePayload> {
        match self {
            Self::Text(_) => None,
            Self::Image(image) => Some(image),
        }
    }
}
