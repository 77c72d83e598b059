//! AT URI parsing.

use std::fmt;

use crate::AtprotoError;

/// A parsed AT Protocol URI.
///
/// AT URIs have the format `at://{authority}/{collection}/{rkey}`, where the
/// authority is either a DID (`did:...`) or a handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    /// Repository authority: a DID or a handle.
    pub authority: String,
    /// Collection NSID (e.g. "app.bsky.feed.post").
    pub collection: String,
    /// Record key.
    pub rkey: String,
}

impl AtUri {
    /// Parse an AT URI string.
    ///
    /// # Example
    ///
    /// ```
    /// use lantern_atproto::AtUri;
    ///
    /// let uri = AtUri::parse("at://did:plc:abc123/app.bsky.feed.post/3abc").unwrap();
    /// assert_eq!(uri.authority, "did:plc:abc123");
    /// assert_eq!(uri.collection, "app.bsky.feed.post");
    /// assert_eq!(uri.rkey, "3abc");
    /// ```
    pub fn parse(uri: &str) -> Result<Self, AtprotoError> {
        let rest = uri
            .strip_prefix("at://")
            .ok_or_else(|| AtprotoError::InvalidUri(format!("missing at:// prefix: {uri}")))?;

        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() != 3 {
            return Err(AtprotoError::InvalidUri(format!(
                "expected authority/collection/rkey: {uri}"
            )));
        }

        if parts.iter().any(|p| p.is_empty()) {
            return Err(AtprotoError::InvalidUri(format!(
                "empty component in URI: {uri}"
            )));
        }

        Ok(Self {
            authority: parts[0].to_string(),
            collection: parts[1].to_string(),
            rkey: parts[2].to_string(),
        })
    }

    /// Whether the authority component is already a DID.
    pub fn authority_is_did(&self) -> bool {
        self.authority.starts_with("did:")
    }

    /// Quick rkey extraction without full parsing.
    ///
    /// Extracts the last path component from any URI-like string. Returns an
    /// empty string if no slash is found after the scheme.
    pub fn extract_rkey(uri: &str) -> &str {
        uri.rsplit('/').next().unwrap_or("")
    }

    /// Quick authority extraction without full parsing.
    ///
    /// Returns an empty string for non-AT-URI input.
    pub fn extract_authority(uri: &str) -> &str {
        let Some(rest) = uri.strip_prefix("at://") else {
            return "";
        };
        rest.split('/').next().unwrap_or("")
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at://{}/{}/{}",
            self.authority, self.collection, self.rkey
        )
    }
}

/// Build a record URI from its parts.
pub fn record_uri(did: &str, collection: &str, rkey: &str) -> String {
    format!("at://{did}/{collection}/{rkey}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_uri() {
        let uri = AtUri::parse("at://did:plc:abc123/app.bsky.feed.post/3abc").unwrap();
        assert_eq!(uri.authority, "did:plc:abc123");
        assert_eq!(uri.collection, "app.bsky.feed.post");
        assert_eq!(uri.rkey, "3abc");
        assert!(uri.authority_is_did());
    }

    #[test]
    fn test_parse_handle_authority() {
        let uri = AtUri::parse("at://alice.example.com/app.bsky.feed.post/3abc").unwrap();
        assert_eq!(uri.authority, "alice.example.com");
        assert!(!uri.authority_is_did());
    }

    #[test]
    fn test_parse_missing_prefix() {
        let result = AtUri::parse("did:plc:abc/collection/rkey");
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("missing at:// prefix")
        );
    }

    #[test]
    fn test_parse_missing_rkey() {
        assert!(AtUri::parse("at://did:plc:abc/collection").is_err());
    }

    #[test]
    fn test_parse_empty_component() {
        let result = AtUri::parse("at://did:plc:abc//rkey");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("empty component"));
    }

    #[test]
    fn test_display_roundtrip() {
        let original = "at://did:plc:abc123/app.bsky.feed.post/xyz789";
        let parsed = AtUri::parse(original).unwrap();
        assert_eq!(parsed.to_string(), original);
    }

    #[test]
    fn test_extract_rkey() {
        assert_eq!(
            AtUri::extract_rkey("at://did:plc:abc/app.bsky.feed.post/3abc123"),
            "3abc123"
        );
        assert_eq!(AtUri::extract_rkey("no-slash"), "no-slash");
        assert_eq!(AtUri::extract_rkey(""), "");
    }

    #[test]
    fn test_extract_authority() {
        assert_eq!(
            AtUri::extract_authority("at://did:plc:abc/app.bsky.feed.post/3abc"),
            "did:plc:abc"
        );
        assert_eq!(AtUri::extract_authority("did:plc:abc"), "");
    }

    #[test]
    fn test_record_uri() {
        assert_eq!(
            record_uri("did:plc:abc", "app.bsky.feed.like", "3k"),
            "at://did:plc:abc/app.bsky.feed.like/3k"
        );
    }
}
