//! XRPC client for origin hosts.
//!
//! Most calls here are unauthenticated single-record reads against whatever
//! PDS a DID document points at. The same client also carries an optional
//! session for the principal's own PDS, used by the write proxy and the
//! follow scraper.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::AtprotoError;

/// An authenticated session on a PDS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub did: String,
    pub handle: String,
    #[serde(rename = "accessJwt")]
    pub access_jwt: String,
    #[serde(rename = "refreshJwt")]
    pub refresh_jwt: String,
}

#[derive(Debug, Deserialize)]
pub struct GetRecordResponse {
    pub uri: String,
    pub cid: Option<String>,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListRecordItem {
    pub uri: String,
    pub cid: Option<String>,
    pub value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct ListRecordsResponse {
    pub records: Vec<ListRecordItem>,
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRecordResponse {
    pub uri: String,
    pub cid: String,
}

/// Client for a single XRPC host.
pub struct XrpcClient {
    http: Client,
    host: String,
    session: Arc<RwLock<Option<Session>>>,
}

impl XrpcClient {
    /// Create a client for the given host URL (e.g. `https://pds.example.com`).
    pub fn new(host: impl Into<String>) -> Result<Self, AtprotoError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            host: host.into(),
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Authenticate against this host with identifier and password.
    pub async fn login(&self, identifier: &str, password: &str) -> Result<Session, AtprotoError> {
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            identifier: &'a str,
            password: &'a str,
        }

        let url = format!("{}/xrpc/com.atproto.server.createSession", self.host);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                identifier,
                password,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AtprotoError::Auth(format!("login failed ({status}): {text}")));
        }

        let session: Session = response.json().await?;
        debug!(did = %session.did, handle = %session.handle, "authenticated with PDS");

        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Refresh the current session tokens.
    pub async fn refresh_session(&self) -> Result<(), AtprotoError> {
        let refresh_jwt = {
            let session = self.session.read().await;
            session
                .as_ref()
                .map(|s| s.refresh_jwt.clone())
                .ok_or_else(|| AtprotoError::Auth("no session to refresh".to_string()))?
        };

        let url = format!("{}/xrpc/com.atproto.server.refreshSession", self.host);
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {refresh_jwt}"))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AtprotoError::Auth(format!(
                "refresh failed ({status}): {text}"
            )));
        }

        let session: Session = response.json().await?;
        debug!(did = %session.did, "refreshed session");
        *self.session.write().await = Some(session);
        Ok(())
    }

    /// DID of the current session, if logged in.
    pub async fn did(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.did.clone())
    }

    /// Handle of the current session, if logged in.
    pub async fn handle(&self) -> Option<String> {
        self.session.read().await.as_ref().map(|s| s.handle.clone())
    }

    async fn access_token(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.access_jwt.clone())
    }

    fn is_expired_token_error(err: &AtprotoError) -> bool {
        matches!(err, AtprotoError::Xrpc { error, .. } if error == "ExpiredToken")
    }

    async fn try_refresh(&self) -> bool {
        match self.refresh_session().await {
            Ok(()) => {
                debug!("automatically refreshed expired session");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to auto-refresh session");
                false
            }
        }
    }

    /// Fetch a single record (`com.atproto.repo.getRecord`).
    pub async fn get_record(
        &self,
        repo: &str,
        collection: &str,
        rkey: &str,
    ) -> Result<GetRecordResponse, AtprotoError> {
        let url = format!("{}/xrpc/com.atproto.repo.getRecord", self.host);
        let response = self
            .http
            .get(&url)
            .query(&[("repo", repo), ("collection", collection), ("rkey", rkey)])
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AtprotoError::NotFound {
                collection: collection.to_string(),
                rkey: rkey.to_string(),
            });
        }

        handle_response(response).await
    }

    /// List records in a collection (`com.atproto.repo.listRecords`).
    pub async fn list_records(
        &self,
        repo: &str,
        collection: &str,
        limit: u32,
        cursor: Option<&str>,
    ) -> Result<ListRecordsResponse, AtprotoError> {
        let url = format!("{}/xrpc/com.atproto.repo.listRecords", self.host);

        let mut query: Vec<(&str, String)> = vec![
            ("repo", repo.to_string()),
            ("collection", collection.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let response = self.http.get(&url).query(&query).send().await?;
        handle_response(response).await
    }

    /// Fetch the full repository as a CAR (`com.atproto.sync.getRepo`).
    ///
    /// Returns the CAR bytes and the revision from the response header.
    pub async fn get_repo(&self, did: &str) -> Result<(Vec<u8>, Option<String>), AtprotoError> {
        let url = format!("{}/xrpc/com.atproto.sync.getRepo", self.host);
        let response = self.http.get(&url).query(&[("did", did)]).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if let Ok(xrpc) = serde_json::from_str::<XrpcErrorBody>(&text) {
                return Err(AtprotoError::Xrpc {
                    error: xrpc.error,
                    message: xrpc.message,
                });
            }
            return Err(AtprotoError::InvalidResponse(format!(
                "getRepo failed ({status}): {text}"
            )));
        }

        let repo_rev = response
            .headers()
            .get("Atproto-Repo-Rev")
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let bytes = response.bytes().await?.to_vec();
        debug!(size = bytes.len(), rev = ?repo_rev, "fetched repo CAR");
        Ok((bytes, repo_rev))
    }

    /// Create a record in the session repo (`com.atproto.repo.createRecord`).
    ///
    /// Retries once after refreshing an expired access token.
    pub async fn create_record(
        &self,
        collection: &str,
        record: &serde_json::Value,
    ) -> Result<CreateRecordResponse, AtprotoError> {
        let did = self
            .did()
            .await
            .ok_or_else(|| AtprotoError::Auth("not authenticated".to_string()))?;

        #[derive(Serialize)]
        struct CreateRequest<'a> {
            repo: &'a str,
            collection: &'a str,
            record: &'a serde_json::Value,
        }

        let url = format!("{}/xrpc/com.atproto.repo.createRecord", self.host);

        let mut last_err = None;
        for attempt in 0..2 {
            let token = self
                .access_token()
                .await
                .ok_or_else(|| AtprotoError::Auth("not authenticated".to_string()))?;

            let response = self
                .http
                .post(&url)
                .header("Authorization", format!("Bearer {token}"))
                .json(&CreateRequest {
                    repo: &did,
                    collection,
                    record,
                })
                .send()
                .await?;

            match handle_response(response).await {
                Ok(out) => return Ok(out),
                Err(e) => {
                    if attempt == 0 && Self::is_expired_token_error(&e) && self.try_refresh().await
                    {
                        last_err = Some(e);
                        continue;
                    }
                    return Err(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| AtprotoError::Auth("token refresh loop failed".into())))
    }
}

#[derive(Debug, Deserialize)]
struct XrpcErrorBody {
    error: String,
    message: String,
}

async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, AtprotoError> {
    let status = response.status();

    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        if let Ok(xrpc) = serde_json::from_str::<XrpcErrorBody>(&text) {
            return Err(AtprotoError::Xrpc {
                error: xrpc.error,
                message: xrpc.message,
            });
        }
        return Err(AtprotoError::InvalidResponse(format!(
            "request failed ({status}): {text}"
        )));
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_did_without_session() {
        let client = XrpcClient::new("https://example.com").unwrap();
        assert_eq!(client.did().await, None);
    }

    #[tokio::test]
    async fn test_login_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "did": "did:plc:testuser123",
                "handle": "test.example.com",
                "accessJwt": "access-token",
                "refreshJwt": "refresh-token"
            })))
            .mount(&server)
            .await;

        let client = XrpcClient::new(server.uri()).unwrap();
        let session = client.login("test.example.com", "password123").await.unwrap();
        assert_eq!(session.did, "did:plc:testuser123");
        assert_eq!(client.did().await.as_deref(), Some("did:plc:testuser123"));
    }

    #[tokio::test]
    async fn test_login_failure() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "error": "AuthenticationRequired",
                "message": "Invalid credentials"
            })))
            .mount(&server)
            .await;

        let client = XrpcClient::new(server.uri()).unwrap();
        let result = client.login("test.example.com", "wrong").await;
        assert!(matches!(result, Err(AtprotoError::Auth(_))));
    }

    #[tokio::test]
    async fn test_get_record_unauthenticated() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.getRecord"))
            .and(query_param("repo", "did:plc:someone"))
            .and(query_param("collection", "app.bsky.feed.post"))
            .and(query_param("rkey", "3abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "uri": "at://did:plc:someone/app.bsky.feed.post/3abc",
                "cid": "bafypost",
                "value": {"text": "hi", "createdAt": "2024-05-01T12:00:00Z"}
            })))
            .mount(&server)
            .await;

        let client = XrpcClient::new(server.uri()).unwrap();
        let rec = client
            .get_record("did:plc:someone", "app.bsky.feed.post", "3abc")
            .await
            .unwrap();
        assert_eq!(rec.cid.as_deref(), Some("bafypost"));
        assert_eq!(rec.value["text"], "hi");
    }

    #[tokio::test]
    async fn test_get_record_not_found() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.getRecord"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = XrpcClient::new(server.uri()).unwrap();
        let result = client
            .get_record("did:plc:someone", "app.bsky.feed.post", "missing")
            .await;
        assert!(matches!(result, Err(AtprotoError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_list_records_with_cursor() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/xrpc/com.atproto.repo.listRecords"))
            .and(query_param("cursor", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "records": [
                    {
                        "uri": "at://did:plc:me/app.bsky.graph.follow/3f",
                        "cid": "bafyf",
                        "value": {"subject": "did:plc:them", "createdAt": "2024-05-01T12:00:00Z"}
                    }
                ],
                "cursor": null
            })))
            .mount(&server)
            .await;

        let client = XrpcClient::new(server.uri()).unwrap();
        let resp = client
            .list_records("did:plc:me", "app.bsky.graph.follow", 100, Some("page2"))
            .await
            .unwrap();
        assert_eq!(resp.records.len(), 1);
        assert!(resp.cursor.is_none());
    }

    #[tokio::test]
    async fn test_create_record_requires_auth() {
        let client = XrpcClient::new("https://example.com").unwrap();
        let result = client
            .create_record("app.bsky.feed.post", &serde_json::json!({"text": "x"}))
            .await;
        assert!(matches!(result, Err(AtprotoError::Auth(_))));
    }

    #[tokio::test]
    async fn test_create_record_surfaces_upstream_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.server.createSession"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "did": "did:plc:me",
                "handle": "me.example.com",
                "accessJwt": "access",
                "refreshJwt": "refresh"
            })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/xrpc/com.atproto.repo.createRecord"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "InvalidRecord",
                "message": "record failed validation"
            })))
            .mount(&server)
            .await;

        let client = XrpcClient::new(server.uri()).unwrap();
        client.login("me.example.com", "pw").await.unwrap();

        let result = client
            .create_record("app.bsky.feed.post", &serde_json::json!({"text": "x"}))
            .await;
        match result {
            Err(AtprotoError::Xrpc { error, message }) => {
                assert_eq!(error, "InvalidRecord");
                assert!(message.contains("validation"));
            }
            other => panic!("expected xrpc error, got {other:?}"),
        }
    }
}
