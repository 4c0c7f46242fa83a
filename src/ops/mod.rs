//! Orchestration protocols: one function per user-facing operation.
//!
//! Each operation is a short fixed script over one or two session
//! clients, always gated (except plain login) by a cookie-verification
//! round-trip against the account client. Scripts acquire the advisory
//! lock of every client they converse with, for the whole conversation.
//!
//! Every failure mode — missing connection, verification refusal,
//! protocol-level rejection, timeout, bad input — is caught here and
//! returned as an [`OpError`]; transport faults never escape raw.

pub mod account;
pub mod discussion;
pub mod messaging;
pub mod problems;
pub mod submission;

use crate::client::{ClientError, SessionClient};
use crate::ids::{self, IdError};
use crate::registry::Registry;

/// Uniform failure shape returned by every orchestration function.
#[derive(Debug)]
pub enum OpError {
    /// A required backend connection is missing or down.
    ServiceUnavailable(&'static str),
    /// The account service rejected the session cookie.
    VerificationFailed,
    /// The cookie carries no usable embedded user id.
    BadCookie,
    /// The remote answered with a protocol-level rejection.
    Rejected(String),
    /// The queried record does not exist on its owning server.
    UnknownRecord,
    /// Submission language is not in the allow-list.
    UnsupportedLanguage(String),
    /// Malformed composite id.
    InvalidId(IdError),
    /// No judge server with the needed capability is connected.
    NoJudgeAvailable,
    /// Transport-level failure (disconnect, timeout, framing).
    Transport(ClientError),
    /// The remote sent a response we could not interpret.
    Malformed(String),
}

impl std::fmt::Display for OpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpError::ServiceUnavailable(which) => write!(f, "{} server not connected", which),
            OpError::VerificationFailed => write!(f, "Cookie verification failed"),
            OpError::BadCookie => write!(f, "Cookie carries no user id"),
            OpError::Rejected(msg) => write!(f, "Rejected by remote: {}", msg),
            OpError::UnknownRecord => write!(f, "Unknown record id"),
            OpError::UnsupportedLanguage(lan) => write!(f, "Unsupported language: {}", lan),
            OpError::InvalidId(e) => write!(f, "{}", e),
            OpError::NoJudgeAvailable => write!(f, "No judge server available"),
            OpError::Transport(e) => write!(f, "{}", e),
            OpError::Malformed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for OpError {}

impl From<ClientError> for OpError {
    fn from(e: ClientError) -> Self {
        OpError::Transport(e)
    }
}

impl From<IdError> for OpError {
    fn from(e: IdError) -> Self {
        OpError::InvalidId(e)
    }
}

pub type OpResult<T> = Result<T, OpError>;

/// The account client, required connected.
pub(crate) fn account(registry: &Registry) -> OpResult<SessionClient> {
    let client = registry
        .account_client()
        .ok_or(OpError::ServiceUnavailable("Account"))?;
    if !client.is_connected() {
        return Err(OpError::ServiceUnavailable("Account"));
    }
    Ok(client)
}

/// The verification gate: `'V'` with the cookie on the account client,
/// response body must be exactly `"Y"`. Holds the account lock only for
/// this single round-trip.
pub(crate) async fn require_verified(registry: &Registry, cookie: &str) -> OpResult<()> {
    let client = account(registry)?;
    let _lock = client.acquire_lock().await?;
    let resp = client.send_and_wait(b'V', cookie).await?;
    if resp.body == "Y" {
        Ok(())
    } else {
        Err(OpError::VerificationFailed)
    }
}

/// User id embedded in the cookie; operations that key on it fail closed
/// on a malformed cookie.
pub(crate) fn embedded_uid(cookie: &str) -> OpResult<String> {
    ids::extract_embedded_user_id(cookie).ok_or(OpError::BadCookie)
}

/// Parse a JSON-shaped response body.
pub(crate) fn parse_json(body: &str) -> OpResult<serde_json::Value> {
    serde_json::from_str(body).map_err(|e| OpError::Malformed(format!("Bad JSON from peer: {}", e)))
}

/// Sequence tokens assigned by judge servers arrive as the zero-padded
/// hex digits that also form the tail of a composite id.
pub(crate) fn parse_sequence(body: &str) -> OpResult<u32> {
    u32::from_str_radix(body.trim(), 16)
        .map_err(|_| OpError::Malformed(format!("Bad sequence token: {:?}", body)))
}
