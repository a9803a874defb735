//! Envelope `type` values and well-known field names.

/// Handshake step 5/6 identity request.
pub const GET_USER_ID: &str = "getUserID";
/// Handshake step 7 acknowledgement.
pub const READY: &str = "ready";

pub const BROADCAST_MESSAGE: &str = "broadcastMessage";
pub const WHISPER: &str = "whisper";
pub const WHISPER_OK: &str = "whisper.ok";
pub const GET_USERS: &str = "getUsers";
pub const USER_CONNECT: &str = "user.connect";
pub const USER_DISCONNECT: &str = "user.disconnect";

pub const ERROR_INVALID_PARAMETERS: &str = "error.invalidParameters";
pub const ERROR_INVALID_USER: &str = "error.invalidUser";
pub const ERROR_INVALID_MESSAGE: &str = "error.invalidMessage";
pub const ERROR_INVALID_JSON: &str = "error.invalidJSON";
pub const ERROR_INVALID_PACKET_TYPE: &str = "error.invalidPacketType";

/// Prefix shared by every error envelope type.
pub const ERROR_PREFIX: &str = "error.";

pub mod fields {
    pub const TYPE: &str = "type";
    /// Echo of the envelope a reply answers.
    pub const RECV: &str = "recv";
    /// Client correlation tag.
    pub const SENDER_ID: &str = "SENDER_ID";
    pub const USER_ID: &str = "userID";
    pub const USER: &str = "user";
    pub const USERS: &str = "users";
    pub const MESSAGE: &str = "message";
    pub const AUTHOR: &str = "author";
    pub const FROM: &str = "from";
}
