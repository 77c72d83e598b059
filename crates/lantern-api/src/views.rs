//! Client-facing view shapes and CDN URL rewriting.

use serde::Serialize;

use lantern_atproto::records::ActorProfile;

use crate::hydration::actor::{ActorInfo, ActorInfoDetailed};

/// CDN base for image blobs.
const IMG_CDN: &str = "https://cdn.bsky.app/img";
/// CDN base for video blobs.
const VIDEO_CDN: &str = "https://video.bsky.app/watch";

pub fn avatar_thumbnail_url(did: &str, cid: &str) -> String {
    format!("{IMG_CDN}/avatar_thumbnail/plain/{did}/{cid}@jpeg")
}

pub fn feed_fullsize_url(did: &str, cid: &str) -> String {
    format!("{IMG_CDN}/feed_fullsize/plain/{did}/{cid}@jpeg")
}

pub fn feed_thumbnail_url(did: &str, cid: &str) -> String {
    format!("{IMG_CDN}/feed_thumbnail/plain/{did}/{cid}@jpeg")
}

/// Video URLs percent-encode the DID's colons.
fn encode_did_for_video(did: &str) -> String {
    did.replace(':', "%3A")
}

pub fn video_playlist_url(did: &str, cid: &str) -> String {
    format!("{VIDEO_CDN}/{}/{cid}/playlist.m3u8", encode_did_for_video(did))
}

pub fn video_thumbnail_url(did: &str, cid: &str) -> String {
    format!("{VIDEO_CDN}/{}/{cid}/thumbnail.jpg", encode_did_for_video(did))
}

// =============================================================================
// Actor views
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ProfileViewBasic {
    pub did: String,
    pub handle: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileViewDetailed {
    pub did: String,
    pub handle: String,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(rename = "followersCount")]
    pub followers_count: i64,
    #[serde(rename = "followsCount")]
    pub follows_count: i64,
    #[serde(rename = "postsCount")]
    pub posts_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ViewerState>,
}

/// Per-request viewer relations on a profile.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewerState {
    #[serde(rename = "blockedBy", skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(rename = "followedBy", skip_serializing_if = "Option::is_none")]
    pub followed_by: Option<String>,
}

fn display_name_of(profile: Option<&ActorProfile>) -> Option<String> {
    profile
        .and_then(|p| p.display_name.clone())
        .filter(|n| !n.is_empty())
}

fn avatar_of(did: &str, profile: Option<&ActorProfile>) -> Option<String> {
    profile
        .and_then(|p| p.avatar.as_ref())
        .map(|blob| avatar_thumbnail_url(did, &blob.cid.link))
}

pub fn profile_view_basic(actor: &ActorInfo) -> ProfileViewBasic {
    ProfileViewBasic {
        did: actor.did.clone(),
        handle: actor.handle.clone(),
        display_name: display_name_of(actor.profile.as_ref()),
        avatar: avatar_of(&actor.did, actor.profile.as_ref()),
    }
}

pub fn profile_view(actor: &ActorInfo) -> ProfileView {
    ProfileView {
        did: actor.did.clone(),
        handle: actor.handle.clone(),
        display_name: display_name_of(actor.profile.as_ref()),
        description: actor
            .profile
            .as_ref()
            .and_then(|p| p.description.clone())
            .filter(|d| !d.is_empty()),
        avatar: avatar_of(&actor.did, actor.profile.as_ref()),
    }
}

pub fn profile_view_detailed(actor: &ActorInfoDetailed) -> ProfileViewDetailed {
    let banner = actor
        .info
        .profile
        .as_ref()
        .and_then(|p| p.banner.as_ref())
        .map(|blob| avatar_thumbnail_url(&actor.info.did, &blob.cid.link));

    ProfileViewDetailed {
        did: actor.info.did.clone(),
        handle: actor.info.handle.clone(),
        display_name: display_name_of(actor.info.profile.as_ref()),
        description: actor
            .info
            .profile
            .as_ref()
            .and_then(|p| p.description.clone())
            .filter(|d| !d.is_empty()),
        avatar: avatar_of(&actor.info.did, actor.info.profile.as_ref()),
        banner,
        followers_count: actor.follower_count,
        follows_count: actor.follow_count,
        posts_count: actor.post_count,
        viewer: actor.viewer.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cdn_urls() {
        assert_eq!(
            feed_fullsize_url("did:plc:a", "bafyimg"),
            "https://cdn.bsky.app/img/feed_fullsize/plain/did:plc:a/bafyimg@jpeg"
        );
        assert_eq!(
            avatar_thumbnail_url("did:plc:a", "bafyav"),
            "https://cdn.bsky.app/img/avatar_thumbnail/plain/did:plc:a/bafyav@jpeg"
        );
    }

    #[test]
    fn test_video_urls_encode_did() {
        assert_eq!(
            video_playlist_url("did:plc:a", "bafyvid"),
            "https://video.bsky.app/watch/did%3Aplc%3Aa/bafyvid/playlist.m3u8"
        );
        assert_eq!(
            video_thumbnail_url("did:plc:a", "bafyvid"),
            "https://video.bsky.app/watch/did%3Aplc%3Aa/bafyvid/thumbnail.jpg"
        );
    }

    #[test]
    fn test_profile_view_basic_skips_empty_display_name() {
        let actor = ActorInfo {
            did: "did:plc:a".into(),
            handle: "a.example.com".into(),
            profile: Some(ActorProfile {
                display_name: Some(String::new()),
                description: None,
                avatar: None,
                banner: None,
            }),
        };
        let view = profile_view_basic(&actor);
        assert!(view.display_name.is_none());
        assert!(view.avatar.is_none());
    }
}
