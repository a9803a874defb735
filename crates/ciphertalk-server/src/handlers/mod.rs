//! Built-in request handlers.

mod broadcast_message;
mod get_users;
mod whisper;

pub use broadcast_message::BroadcastMessage;
pub use get_users::GetUsers;
pub use whisper::Whisper;
