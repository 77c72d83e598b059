//! AT Protocol plumbing for lantern.
//!
//! This crate holds everything that talks the protocol but knows nothing
//! about the index:
//!
//! - **Identifiers**: AT-URI and DID parsing
//! - **Records**: typed views over the record JSON we index
//! - **Streams**: firehose (CBOR/CAR) and jetstream (JSON) frame decoding,
//!   normalized into one [`CommitEvent`] shape
//! - **CAR**: full-repo CAR walking for rescans
//! - **Client**: XRPC client for origin hosts (PDS instances)
//! - **Identity**: handle/DID resolution against the identity directory

pub mod car;
mod client;
mod error;
mod event;
pub mod firehose;
pub mod identity;
mod ipld;
pub mod jetstream;
pub mod records;
mod uri;

pub use client::{
    CreateRecordResponse, GetRecordResponse, ListRecordItem, ListRecordsResponse, Session,
    XrpcClient,
};
pub use error::AtprotoError;
pub use event::{CommitEvent, OpAction, RecordOp};
pub use ipld::ipld_to_json;
pub use uri::{AtUri, record_uri};
