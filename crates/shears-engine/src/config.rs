use std::collections::HashMap;
use std::env;
use std::path::Path;

use anyhow::{Context, Result};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-3-pro-image-preview";
pub const DEFAULT_MAX_IMAGE_DIM: u32 = 1024;
pub const DEFAULT_PROMPT_SUFFIX: &str = "High resolution, 1024x1024, detailed, professional quality.";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 90;
pub const API_KEY_VARS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

pub use shears_contracts::generation::GenerationFeatures;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub prompt_suffix: Option<String>,
    pub max_image_dim: u32,
    pub request_timeout_secs: u64,
    pub response_modalities: Vec<String>,
    pub features: GenerationFeatures,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: None,
            prompt_suffix: None,
            max_image_dim: DEFAULT_MAX_IMAGE_DIM,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            response_modalities: vec!["TEXT".to_string(), "IMAGE".to_string()],
            features: GenerationFeatures::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults, then `.env` values (if a file is given), then the process
    /// environment.
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        let dotenv = match env_file {
            Some(path) => read_dotenv(path)?,
            None => HashMap::new(),
        };
        Ok(Self::from_lookup(|key| {
            non_empty_env(key).or_else(|| {
                dotenv
                    .get(key)
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
        }))
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let features = GenerationFeatures {
            resize: flag(lookup("SHEARS_RESIZE"), defaults.features.resize),
            refine: flag(lookup("SHEARS_REFINE"), defaults.features.refine),
            regenerate: flag(lookup("SHEARS_REGENERATE"), defaults.features.regenerate),
        };
        Self {
            api_base: lookup("GEMINI_API_BASE")
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_base),
            api_key: API_KEY_VARS.iter().find_map(|key| lookup(key)),
            model: lookup("SHEARS_MODEL").unwrap_or(defaults.model),
            temperature: lookup("SHEARS_TEMPERATURE")
                .as_deref()
                .and_then(parse_temperature),
            prompt_suffix: lookup("SHEARS_PROMPT_SUFFIX"),
            max_image_dim: lookup("SHEARS_MAX_IMAGE_DIM")
                .as_deref()
                .and_then(parse_max_dim)
                .unwrap_or(defaults.max_image_dim),
            request_timeout_secs: lookup("SHEARS_REQUEST_TIMEOUT")
                .as_deref()
                .and_then(parse_timeout_secs)
                .unwrap_or(defaults.request_timeout_secs),
            response_modalities: lookup("SHEARS_RESPONSE_MODALITIES")
                .as_deref()
                .and_then(parse_modalities)
                .unwrap_or(defaults.response_modalities),
            features,
        }
    }

    /// Appends the configured suffix as `"{prompt}. {suffix}"`.
    pub fn enhance_prompt(&self, prompt: &str) -> String {
        let Some(suffix) = self
            .prompt_suffix
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            return prompt.to_string();
        };
        let base = prompt.trim_end().trim_end_matches('.');
        format!("{base}. {suffix}")
    }
}

pub fn parse_temperature(raw: &str) -> Option<f32> {
    let value = raw.trim().parse::<f32>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.clamp(0.0, 2.0))
}

pub fn parse_max_dim(raw: &str) -> Option<u32> {
    let value = raw.trim().parse::<u32>().ok()?;
    Some(value.clamp(64, 8192))
}

pub fn parse_timeout_secs(raw: &str) -> Option<u64> {
    let value = raw.trim().parse::<u64>().ok()?;
    Some(value.clamp(15, 300))
}

/// Comma separated list such as `TEXT` or `TEXT,IMAGE`. Text-only models
/// reject the IMAGE modality, so chat-only setups pass `TEXT`.
pub fn parse_modalities(raw: &str) -> Option<Vec<String>> {
    let mut modalities: Vec<String> = Vec::new();
    for item in raw.split(',') {
        let value = item.trim().to_ascii_uppercase();
        if value.is_empty() {
            continue;
        }
        if !matches!(value.as_str(), "TEXT" | "IMAGE") {
            return None;
        }
        if !modalities.contains(&value) {
            modalities.push(value);
        }
    }
    (!modalities.is_empty()).then_some(modalities)
}

fn flag(raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(|value| value.trim().to_ascii_lowercase()) {
        Some(value) if matches!(value.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(value) if matches!(value.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn read_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    Ok(parse_dotenv(&content))
}

pub fn parse_dotenv(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for raw_line in content.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(stripped) = line.strip_prefix("export ") {
            line = stripped.trim();
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim().to_string();
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
                || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
            {
                value = value[1..value.len() - 1].to_string();
            }
        }
        vars.insert(key.to_string(), value);
    }
    vars
}
