mod store;
mod turn;

pub use store::ConversationStore;
pub use turn::{ImageFormat, ImagePayload, Role, Turn};
