pub mod client;
pub mod config;
pub mod normalize;
pub mod session;
pub mod transport;

pub use client::GenerationClient;
pub use config::{ClientConfig, GenerationFeatures, DEFAULT_PROMPT_SUFFIX};
pub use session::{Exchange, Session};
pub use transport::{ContentPart, DryrunTransport, GeminiTransport, ModelTransport};
