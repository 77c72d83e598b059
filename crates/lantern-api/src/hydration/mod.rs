//! The hydration layer.
//!
//! For a fixed database state, hydration is a pure function of the tables
//! plus the identity directory: posts gain counts, viewer state and expanded
//! embeds; actors gain handles and profiles; threads become depth-annotated
//! trees.

pub mod actor;
pub mod post;
pub mod thread;

use std::sync::Arc;

use lantern_atproto::identity::IdentityDirectory;
use lantern_atproto::AtUri;
use lantern_index::Indexer;

use crate::ApiError;

pub use actor::{ActorInfo, ActorInfoDetailed};
pub use post::HydratedPost;

pub struct Hydrator {
    indexer: Arc<Indexer>,
    dir: Arc<dyn IdentityDirectory>,
}

impl Hydrator {
    pub fn new(indexer: Arc<Indexer>, dir: Arc<dyn IdentityDirectory>) -> Self {
        Self { indexer, dir }
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn dir(&self) -> &dyn IdentityDirectory {
        self.dir.as_ref()
    }

    /// Resolve an account identifier (handle or DID) to a DID.
    pub async fn resolve_did(&self, actor: &str) -> Result<String, ApiError> {
        if actor.starts_with("did:") {
            return Ok(actor.to_string());
        }
        let ident = self.dir.lookup_handle(actor).await?;
        Ok(ident.did)
    }

    /// Rewrite a handle-form AT-URI to DID form.
    pub async fn normalize_uri(&self, uri: &str) -> Result<String, ApiError> {
        let puri = AtUri::parse(uri)?;
        if puri.authority_is_did() {
            return Ok(puri.to_string());
        }
        let ident = self.dir.lookup_handle(&puri.authority).await?;
        Ok(format!(
            "at://{}/{}/{}",
            ident.did, puri.collection, puri.rkey
        ))
    }
}
