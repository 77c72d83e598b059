//! Actor hydration: `{did, handle, profile}` plus detailed counts and
//! viewer relations.

use std::collections::HashMap;

use tracing::warn;

use lantern_atproto::records::ActorProfile;
use lantern_atproto::record_uri;
use lantern_atproto::records::{BLOCK_COLLECTION, FOLLOW_COLLECTION};

use crate::views::ViewerState;
use crate::ApiError;

use super::Hydrator;

#[derive(Debug, Clone)]
pub struct ActorInfo {
    pub did: String,
    pub handle: String,
    pub profile: Option<ActorProfile>,
}

#[derive(Debug, Clone)]
pub struct ActorInfoDetailed {
    pub info: ActorInfo,
    pub follow_count: i64,
    pub follower_count: i64,
    pub post_count: i64,
    pub viewer: Option<ViewerState>,
}

impl Hydrator {
    /// Assemble `{did, handle, profile}`. A missing profile row enqueues a
    /// background fetch and hydrates without one.
    pub async fn hydrate_actor(&self, did: &str) -> Result<ActorInfo, ApiError> {
        let ident = self.dir().lookup_did(did).await?;

        let raw: Option<Vec<u8>> = sqlx::query_scalar(
            "SELECT raw FROM profiles WHERE repo = (SELECT id FROM repos WHERE did = $1)",
        )
        .bind(did)
        .fetch_optional(&self.indexer().db().hot)
        .await
        .map_err(lantern_index::IndexError::from)?
        .flatten();

        let profile = match raw {
            Some(bytes) if !bytes.is_empty() => match serde_json::from_slice(&bytes) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    warn!(did = %did, error = %e, "stored profile is undecodable");
                    None
                }
            },
            _ => {
                if let Err(e) = self.indexer().missing().track(did, false).await {
                    warn!(did = %did, error = %e, "failed to enqueue missing profile");
                }
                None
            }
        };

        Ok(ActorInfo {
            did: did.to_string(),
            handle: ident.handle,
            profile,
        })
    }

    /// Hydrate several actors, skipping the ones that fail.
    pub async fn hydrate_actors(&self, dids: &[String]) -> HashMap<String, ActorInfo> {
        let mut out = HashMap::with_capacity(dids.len());
        for did in dids {
            match self.hydrate_actor(did).await {
                Ok(info) => {
                    out.insert(did.clone(), info);
                }
                Err(e) => {
                    warn!(did = %did, error = %e, "failed to hydrate actor");
                }
            }
        }
        out
    }

    /// Detailed actor view: profile plus counts and viewer relations, the
    /// subqueries issued in parallel.
    pub async fn hydrate_actor_detailed(
        &self,
        did: &str,
        viewer: Option<&str>,
    ) -> Result<ActorInfoDetailed, ApiError> {
        let info = self.hydrate_actor(did).await?;
        let db = self.indexer().db();

        let follows = async {
            sqlx::query_scalar::<_, i64>(
                "SELECT count(*) FROM follows WHERE author = (SELECT id FROM repos WHERE did = $1)",
            )
            .bind(did)
            .fetch_one(&db.hot)
            .await
        };
        let followers = async {
            sqlx::query_scalar::<_, i64>(
                "SELECT count(*) FROM follows WHERE subject = (SELECT id FROM repos WHERE did = $1)",
            )
            .bind(did)
            .fetch_one(&db.hot)
            .await
        };
        let posts = async {
            sqlx::query_scalar::<_, i64>(
                "SELECT count(*) FROM posts WHERE author = (SELECT id FROM repos WHERE did = $1)",
            )
            .bind(did)
            .fetch_one(&db.hot)
            .await
        };

        let (follow_count, follower_count, post_count) = tokio::join!(follows, followers, posts);

        let viewer_state = match viewer {
            Some(viewer) if !viewer.is_empty() => {
                Some(self.profile_viewer_state(did, viewer).await?)
            }
            _ => None,
        };

        Ok(ActorInfoDetailed {
            info,
            follow_count: follow_count.map_err(lantern_index::IndexError::from)?,
            follower_count: follower_count.map_err(lantern_index::IndexError::from)?,
            post_count: post_count.map_err(lantern_index::IndexError::from)?,
            viewer: viewer_state,
        })
    }

    /// Block/follow relations between a profile and the viewer, all four
    /// directions queried in parallel.
    async fn profile_viewer_state(
        &self,
        did: &str,
        viewer: &str,
    ) -> Result<ViewerState, ApiError> {
        let (blocked_by, blocking, following, followed_by) = tokio::join!(
            self.block_pair(did, viewer),
            self.block_pair(viewer, did),
            self.follow_pair(viewer, did),
            self.follow_pair(did, viewer),
        );

        let mut state = ViewerState::default();
        if blocked_by?.is_some() {
            state.blocked_by = Some(true);
        }
        if let Some(rkey) = blocking? {
            state.blocking = Some(record_uri(viewer, BLOCK_COLLECTION, &rkey));
        }
        if let Some(rkey) = following? {
            state.following = Some(record_uri(viewer, FOLLOW_COLLECTION, &rkey));
        }
        if let Some(rkey) = followed_by? {
            state.followed_by = Some(record_uri(did, FOLLOW_COLLECTION, &rkey));
        }
        Ok(state)
    }

    /// rkey of a block by `a` against `b`, if one exists.
    async fn block_pair(&self, a: &str, b: &str) -> Result<Option<String>, ApiError> {
        Ok(sqlx::query_scalar(
            "SELECT rkey FROM blocks
             WHERE author = (SELECT id FROM repos WHERE did = $1)
             AND subject = (SELECT id FROM repos WHERE did = $2)",
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.indexer().db().hot)
        .await
        .map_err(lantern_index::IndexError::from)?)
    }

    /// rkey of a follow by `a` of `b`, if one exists.
    async fn follow_pair(&self, a: &str, b: &str) -> Result<Option<String>, ApiError> {
        Ok(sqlx::query_scalar(
            "SELECT rkey FROM follows
             WHERE author = (SELECT id FROM repos WHERE did = $1)
             AND subject = (SELECT id FROM repos WHERE did = $2)",
        )
        .bind(a)
        .bind(b)
        .fetch_optional(&self.indexer().db().hot)
        .await
        .map_err(lantern_index::IndexError::from)?)
    }
}
