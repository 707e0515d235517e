//! Bridge error taxonomy.

use thiserror::Error;

/// Errors surfaced by the framing, command-translation, and BLE session layers.
///
/// `IdleTimeout` is deliberately not a variant here: an idle-disconnect is a
/// normal [`crate::types::ConnectionState`] transition, not a failure.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// A reassembly buffer received a malformed or out-of-order frame
    /// (bad opcode, length mismatch, non-monotonic sequence number).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The underlying BLE link failed (GATT write/read/subscribe error,
    /// unexpected disconnect signalled by BlueZ).
    #[error("transport error: {0}")]
    Transport(String),

    /// GATT connect did not complete within the configured deadline.
    #[error("connect timed out after {0}ms")]
    ConnectTimeout(u64),

    /// The device's BlueZ object tree or GATT characteristics didn't match
    /// what a FIDO2 BLE authenticator is required to expose.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<bluer::Error> for BridgeError {
    fn from(e: bluer::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(e: std::io::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}
