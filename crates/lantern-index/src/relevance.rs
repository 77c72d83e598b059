//! The relevance set: DIDs whose activity we index.
//!
//! Bootstrapped from the principal's follows, grown at runtime whenever the
//! missing-record fetcher touches a new DID. The set only grows within a
//! process lifetime.

use dashmap::DashSet;

use lantern_atproto::AtUri;

#[derive(Default)]
pub struct RelevanceSet {
    dids: DashSet<String>,
}

impl RelevanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, did: &str) {
        self.dids.insert(did.to_string());
    }

    pub fn is_relevant(&self, did: &str) -> bool {
        self.dids.contains(did)
    }

    /// Whether any of the given identifiers belongs to a relevant DID. Each
    /// identifier may be a DID or an AT-URI, in which case its authority is
    /// checked. Malformed identifiers are skipped.
    pub fn any_relevant<'a>(&self, idents: impl IntoIterator<Item = &'a str>) -> bool {
        for ident in idents {
            if ident.starts_with("did:") {
                if self.is_relevant(ident) {
                    return true;
                }
            } else if ident.starts_with("at://") {
                let authority = AtUri::extract_authority(ident);
                if !authority.is_empty() && self.is_relevant(authority) {
                    return true;
                }
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.dids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dids.is_empty()
    }

    /// Snapshot of all relevant DIDs.
    pub fn snapshot(&self) -> Vec<String> {
        self.dids.iter().map(|d| d.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_lookup() {
        let set = RelevanceSet::new();
        assert!(!set.is_relevant("did:plc:alice"));
        set.add("did:plc:alice");
        assert!(set.is_relevant("did:plc:alice"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_any_relevant_by_did() {
        let set = RelevanceSet::new();
        set.add("did:plc:alice");
        assert!(set.any_relevant(["did:plc:bob", "did:plc:alice"]));
        assert!(!set.any_relevant(["did:plc:bob"]));
    }

    #[test]
    fn test_any_relevant_by_uri_authority() {
        let set = RelevanceSet::new();
        set.add("did:plc:alice");
        assert!(set.any_relevant(["at://did:plc:alice/app.bsky.feed.post/3abc"]));
        assert!(!set.any_relevant(["at://did:plc:bob/app.bsky.feed.post/3abc"]));
    }

    #[test]
    fn test_any_relevant_skips_malformed() {
        let set = RelevanceSet::new();
        set.add("did:plc:alice");
        assert!(!set.any_relevant(["http://example.com", "not-an-ident", ""]));
    }

    #[test]
    fn test_reply_chain_closure() {
        // A post by a stranger whose parent belongs to a relevant DID is in
        // scope because the parent URI's authority matches.
        let set = RelevanceSet::new();
        set.add("did:plc:principal");
        let idents = [
            "did:plc:stranger",
            "at://did:plc:principal/app.bsky.feed.post/r0",
            "at://did:plc:other/app.bsky.feed.post/root",
        ];
        assert!(set.any_relevant(idents));
    }
}
