pub mod channel;
pub mod entity;
pub mod message;
pub mod user;

pub use channel::ChatChannel;
pub use entity::{Entity, EntityId, EntityKind};
pub use message::ChatMessage;
pub use user::ChatUser;
