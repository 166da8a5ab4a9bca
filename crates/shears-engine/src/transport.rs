use std::io::Cursor;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat as CodecFormat, Rgb, RgbImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use shears_contracts::errors::{GenerationError, GenerationResult, TransportError};
use tracing::debug;

use crate::config::{ClientConfig, API_KEY_VARS};

/// One fragment of a multimodal message on the wire, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    InlineData { mime_type: String, data: Vec<u8> },
}

impl ContentPart {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::InlineData { .. })
    }
}

/// The remote model as seen by the client: ordered parts in, ordered parts out.
pub trait ModelTransport: Send + Sync {
    fn name(&self) -> &str;
    fn send(
        &self,
        parts: &[ContentPart],
        temperature: Option<f32>,
    ) -> GenerationResult<Vec<ContentPart>>;
}

/// `models/{model}:generateContent` on the Gemini REST API.
pub struct GeminiTransport {
    api_base: String,
    api_key: Option<String>,
    model: String,
    response_modalities: Vec<String>,
    timeout: Duration,
    http: HttpClient,
}

impl GeminiTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            response_modalities: config.response_modalities.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            http: HttpClient::new(),
        }
    }

    pub fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(&self, parts: &[ContentPart], temperature: Option<f32>) -> Value {
        let wire_parts: Vec<Value> = parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => json!({ "text": text }),
                ContentPart::InlineData { mime_type, data } => json!({
                    "inlineData": {
                        "mimeType": mime_type,
                        "data": BASE64.encode(data),
                    }
                }),
            })
            .collect();

        let mut generation_config = Map::new();
        if !self.response_modalities.is_empty() {
            generation_config.insert(
                "responseModalities".to_string(),
                Value::Array(
                    self.response_modalities
                        .iter()
                        .cloned()
                        .map(Value::String)
                        .collect(),
                ),
            );
        }
        if let Some(temperature) = temperature {
            generation_config.insert("temperature".to_string(), json!(temperature));
        }

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            Value::Array(vec![json!({
                "role": "user",
                "parts": wire_parts,
            })]),
        );
        if !generation_config.is_empty() {
            payload.insert(
                "generationConfig".to_string(),
                Value::Object(generation_config),
            );
        }
        Value::Object(payload)
    }
}

impl ModelTransport for GeminiTransport {
    fn name(&self) -> &str {
        "gemini"
    }

    fn send(
        &self,
        parts: &[ContentPart],
        temperature: Option<f32>,
    ) -> GenerationResult<Vec<ContentPart>> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(TransportError::MissingCredential(API_KEY_VARS.join(" or ")).into());
        };
        let endpoint = self.endpoint();
        let payload = self.build_payload(parts, temperature);
        debug!(
            endpoint = %endpoint,
            parts = parts.len(),
            images = parts.iter().filter(|part| part.is_image()).count(),
            timeout_secs = self.timeout.as_secs(),
            "sending generateContent request"
        );

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .map_err(|err| TransportError::request(endpoint.as_str(), err))?;
        let response_payload = response_json_or_error(&endpoint, response)?;
        extract_parts(&response_payload)
    }
}

fn response_json_or_error(endpoint: &str, response: HttpResponse) -> GenerationResult<Value> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| TransportError::request(endpoint, err))?;
    if !status.is_success() {
        return Err(TransportError::Rejected {
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        }
        .into());
    }
    serde_json::from_str(&body)
        .map_err(|err| GenerationError::malformed(format!("endpoint returned invalid JSON: {err}")))
}

/// Flattens the first candidate of a `generateContent` reply into ordered
/// parts. Accepts both camelCase and snake_case inline data keys.
pub fn extract_parts(response_payload: &Value) -> GenerationResult<Vec<ContentPart>> {
    let candidates = response_payload
        .get("candidates")
        .and_then(Value::as_array)
        .filter(|rows| !rows.is_empty())
        .ok_or_else(|| {
            let reason = response_payload
                .get("promptFeedback")
                .and_then(|feedback| feedback.get("blockReason"))
                .and_then(Value::as_str)
                .map(|reason| format!(" (blocked: {reason})"))
                .unwrap_or_default();
            GenerationError::malformed(format!("reply has no candidates{reason}"))
        })?;

    let parts = candidates[0]
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .ok_or_else(|| {
            let finish = candidates[0]
                .get("finishReason")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            GenerationError::malformed(format!("candidate has no content parts (finish reason {finish})"))
        })?;

    let mut out = Vec::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push(ContentPart::Text(text.to_string()));
            continue;
        }
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            return Err(GenerationError::malformed("inline data part is empty"));
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .map_err(|err| GenerationError::malformed(format!("inline data is not base64: {err}")))?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png")
            .to_string();
        out.push(ContentPart::InlineData {
            mime_type,
            data: bytes,
        });
    }
    Ok(out)
}

/// Offline transport: echoes a caption and a solid-colour PNG whose colour
/// is derived from the prompt.
pub struct DryrunTransport {
    width: u32,
    height: u32,
}

impl DryrunTransport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
        }
    }
}

impl Default for DryrunTransport {
    fn default() -> Self {
        Self::new(1024, 1024)
    }
}

impl ModelTransport for DryrunTransport {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn send(
        &self,
        parts: &[ContentPart],
        temperature: Option<f32>,
    ) -> GenerationResult<Vec<ContentPart>> {
        let prompt = parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text(text) => Some(text.as_str()),
                ContentPart::InlineData { .. } => None,
            })
            .collect::<Vec<&str>>()
            .join("\n");
        let input_images = parts.iter().filter(|part| part.is_image()).count();
        let (r, g, b) = color_from_prompt(&prompt, input_images as u64);
        let image = RgbImage::from_pixel(self.width, self.height, Rgb([r, g, b]));
        let mut encoded = Cursor::new(Vec::new());
        image
            .write_to(&mut encoded, CodecFormat::Png)
            .map_err(|err| GenerationError::malformed(format!("dryrun encode failed: {err}")))?;

        let caption = format!(
            "dryrun {} #{r:02x}{g:02x}{b:02x} ({} input image(s), temperature {})",
            short_id(&prompt),
            input_images,
            temperature
                .map(|value| value.to_string())
                .unwrap_or_else(|| "default".to_string()),
        );
        Ok(vec![
            ContentPart::Text(caption),
            ContentPart::InlineData {
                mime_type: "image/png".to_string(),
                data: encoded.into_inner(),
            },
        ])
    }
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(&digest[..4])
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
