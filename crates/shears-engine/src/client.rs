use shears_contracts::conversation::ImagePayload;
use shears_contracts::errors::{GenerationError, GenerationResult};
use shears_contracts::generation::{GenerationRequest, GenerationResponsePart};
use tracing::debug;

use crate::config::ClientConfig;
use crate::normalize::decode_inline_image;
use crate::transport::{ContentPart, DryrunTransport, GeminiTransport, ModelTransport};

/// Stateless relay between a [`GenerationRequest`] and the remote model.
///
/// Each call is exactly one transport round trip; the caller decides what to
/// do with the parts that come back.
pub struct GenerationClient {
    config: ClientConfig,
    transport: Box<dyn ModelTransport>,
}

impl GenerationClient {
    pub fn new(config: ClientConfig, transport: Box<dyn ModelTransport>) -> Self {
        Self { config, transport }
    }

    pub fn gemini(config: ClientConfig) -> Self {
        let transport = GeminiTransport::new(&config);
        Self::new(config, Box::new(transport))
    }

    pub fn dryrun(config: ClientConfig) -> Self {
        Self::new(config, Box::new(DryrunTransport::default()))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn generate(&self, request: &GenerationRequest) -> GenerationResult<Vec<GenerationResponsePart>> {
        request.validate()?;
        let parts = self.build_parts(request);
        let temperature = request.sampling_temperature.or(self.config.temperature);
        debug!(
            transport = self.transport.name(),
            parts = parts.len(),
            temperature = ?temperature,
            "issuing generation request"
        );
        let reply = self.transport.send(&parts, temperature)?;
        self.normalize_reply(reply)
    }

    pub fn refine(
        &self,
        prior_image: &ImagePayload,
        instruction: &str,
    ) -> GenerationResult<Vec<GenerationResponsePart>> {
        let request = self.refine_request(prior_image, instruction)?;
        self.generate(&request)
    }

    /// The request a refine call sends: only the prior image and the
    /// instruction. Earlier turns are not carried over.
    pub fn refine_request(
        &self,
        prior_image: &ImagePayload,
        instruction: &str,
    ) -> GenerationResult<GenerationRequest> {
        if !self.config.features.refine {
            return Err(GenerationError::FeatureDisabled("refine"));
        }
        if instruction.trim().is_empty() {
            return Err(GenerationError::invalid("refine needs an instruction"));
        }
        Ok(GenerationRequest::refinement(prior_image.clone(), instruction.trim()))
    }

    /// Prompt text first, then input images, in request order.
    pub(crate) fn build_parts(&self, request: &GenerationRequest) -> Vec<ContentPart> {
        let mut parts = Vec::with_capacity(request.input_images.len() + 1);
        if let Some(prompt) = request.prompt() {
            parts.push(ContentPart::Text(self.config.enhance_prompt(prompt)));
        }
        for image in &request.input_images {
            parts.push(ContentPart::InlineData {
                mime_type: image.mime_type().to_string(),
                data: image.bytes().to_vec(),
            });
        }
        parts
    }

    fn normalize_reply(&self, reply: Vec<ContentPart>) -> GenerationResult<Vec<GenerationResponsePart>> {
        let max_dim = self
            .config
            .features
            .resize
            .then_some(self.config.max_image_dim);
        let mut out = Vec::with_capacity(reply.len());
        for part in reply {
            match part {
                ContentPart::Text(text) => {
                    if !text.trim().is_empty() {
                        out.push(GenerationResponsePart::Text(text));
                    }
                }
                ContentPart::InlineData { mime_type, data } => {
                    let image = decode_inline_image(&mime_type, data, max_dim)?;
                    out.push(GenerationResponsePart::Image(image));
                }
            }
        }
        if out.is_empty() {
            return Err(GenerationError::malformed("reply contained no text or images"));
        }
        Ok(out)
    }
}
