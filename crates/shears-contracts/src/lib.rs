pub mod chat;
pub mod conversation;
pub mod errors;
pub mod events;
pub mod generation;

pub use conversation::{ConversationStore, ImageFormat, ImagePayload, Role, Turn};
pub use errors::{GenerationError, GenerationResult, TransportError};
pub use generation::{GenerationFeatures, GenerationRequest, GenerationResponsePart};
