//! Handshake vocabulary shared by both peers.
//!
//! Rejection codes travel as plain ASCII integers in place of the payload a
//! step expects, and are always followed by the sender closing the stream.

use std::fmt;

/// Default length of the server's verification token, in bytes.
pub const DEFAULT_VERIFICATION_LEN: usize = 32;

/// Smallest verification token the server will issue.
pub const MIN_VERIFICATION_LEN: usize = 16;

/// Out-of-band handshake failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectCode {
    /// `-1`: peer public key could not be parsed.
    InvalidPublicKey,
    /// `-2`: the echoed verification token did not match.
    VerificationMismatch,
    /// `-3`: the identity response could not be decoded.
    InvalidPayload,
    /// `-4`: identity out of bounds, outside the alphabet, or already taken.
    InvalidIdentity,
    /// `-98`: stream closed before the handshake finished.
    PrematureClose,
    /// `-99`: an envelope of the wrong type arrived at steps 5-7.
    UnexpectedPacket,
    /// Any other integer the peer sent.
    Other(i32),
}

impl RejectCode {
    pub fn as_i32(self) -> i32 {
        match self {
            RejectCode::InvalidPublicKey => -1,
            RejectCode::VerificationMismatch => -2,
            RejectCode::InvalidPayload => -3,
            RejectCode::InvalidIdentity => -4,
            RejectCode::PrematureClose => -98,
            RejectCode::UnexpectedPacket => -99,
            RejectCode::Other(code) => code,
        }
    }

    /// ASCII wire form, e.g. `b"-4"`.
    pub fn to_wire(self) -> Vec<u8> {
        self.as_i32().to_string().into_bytes()
    }

    fn describe(self) -> &'static str {
        match self {
            RejectCode::InvalidPublicKey => "invalid public key",
            RejectCode::VerificationMismatch => "verification mismatch",
            RejectCode::InvalidPayload => "undecodable identity payload",
            RejectCode::InvalidIdentity => "invalid or taken identity",
            RejectCode::PrematureClose => "stream closed prematurely",
            RejectCode::UnexpectedPacket => "unexpected packet",
            RejectCode::Other(_) => "peer error",
        }
    }
}

impl From<i32> for RejectCode {
    fn from(code: i32) -> Self {
        match code {
            -1 => RejectCode::InvalidPublicKey,
            -2 => RejectCode::VerificationMismatch,
            -3 => RejectCode::InvalidPayload,
            -4 => RejectCode::InvalidIdentity,
            -98 => RejectCode::PrematureClose,
            -99 => RejectCode::UnexpectedPacket,
            other => RejectCode::Other(other),
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_i32(), self.describe())
    }
}

/// Interpret a received step payload as a sender-transmitted error code.
///
/// Returns `Some` only when the whole payload (surrounding whitespace aside)
/// is a plain decimal integer.
pub fn parse_reject_code(payload: &[u8]) -> Option<RejectCode> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() || text.len() > 11 {
        return None;
    }
    text.parse::<i32>().ok().map(RejectCode::from)
}
