//! Error types for the protocol layer.

use thiserror::Error;

/// Errors that can occur when speaking the protocol.
#[derive(Debug, Error)]
pub enum AtprotoError {
    /// Malformed AT-URI.
    #[error("invalid AT URI: {0}")]
    InvalidUri(String),

    /// Malformed DID.
    #[error("invalid DID: {0}")]
    InvalidDid(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record not found on the origin host.
    #[error("record not found: {collection}/{rkey}")]
    NotFound { collection: String, rkey: String },

    /// Identity could not be resolved.
    #[error("identity resolution failed for {ident}: {reason}")]
    IdentityResolution { ident: String, reason: String },

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// XRPC error from an upstream server.
    #[error("XRPC error: {error} - {message}")]
    Xrpc { error: String, message: String },

    /// Invalid response from an upstream server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// CAR parsing error.
    #[error("CAR parse error: {0}")]
    CarParse(String),

    /// CBOR decoding error.
    #[error("CBOR decode error: {0}")]
    CborDecode(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Malformed record timestamp.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
