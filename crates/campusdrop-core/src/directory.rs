// Challenge directory: request/response access to the campus challenge list.
//
// The fallback poller is the only consumer. The HTTP implementation talks to
// `GET {api_base_url}/challenges` and reads the server clock from the
// response `Date` header.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::config::Config;
use crate::protocol::Challenge;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to decode challenge list from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

/// One fetch of the challenge list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChallengeListing {
    pub challenges: Vec<Challenge>,
    /// Server clock reading taken from the response, when available.
    pub server_time: Option<DateTime<Utc>>,
}

/// Source of the full challenge list for the user's campus.
#[async_trait]
pub trait ChallengeDirectory: Send + Sync {
    async fn list(&self) -> Result<ChallengeListing, DirectoryError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpDirectory {
    http: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_token,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.server.api_base_url.clone(),
            config.credentials.token().map(str::to_string),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/challenges", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChallengeDirectory for HttpDirectory {
    async fn list(&self) -> Result<ChallengeListing, DirectoryError> {
        let url = self.endpoint();
        let mut request = self.http.get(&url);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|source| DirectoryError::Request {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Status { url, status });
        }

        let server_time = response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);

        let records: Vec<Value> = response.json().await.map_err(|e| DirectoryError::Decode {
            url: url.clone(),
            message: e.to_string(),
        })?;

        Ok(ChallengeListing {
            challenges: decode_records(records),
            server_time,
        })
    }
}

/// Parse an HTTP `Date` header (IMF-fixdate, e.g. `Sun, 18 Oct 2026 17:00:00 GMT`).
pub(crate) fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Label carried by errors for records that came from the directory.
const DIRECTORY_SOURCE: &str = "directory";

/// Decode each record independently; malformed ones are skipped.
pub(crate) fn decode_records(records: Vec<Value>) -> Vec<Challenge> {
    records
        .into_iter()
        .filter_map(|record| match Challenge::from_value(record, DIRECTORY_SOURCE) {
            Ok(challenge) => Some(challenge),
            Err(e) => {
                warn!("skipping directory record: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn record(id: &str) -> Value {
        json!({
            "id": id,
            "title": "Sunrise run",
            "scheduledAt": "2026-10-18T06:00:00Z",
            "expiresAt": "2026-10-18T07:00:00Z",
            "campusId": "uiuc123",
            "isBonus": true
        })
    }

    /// Serve one canned HTTP response and hand back the raw request text.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}/api/v1"), task)
    }

    fn json_response(status: &str, date: Option<&str>, body: &str) -> String {
        let date_line = date.map(|d| format!("Date: {d}\r\n")).unwrap_or_default();
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\n{date_line}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn parses_imf_fixdate() {
        let t = parse_http_date("Sun, 18 Oct 2026 17:00:00 GMT").unwrap();
        assert_eq!(t, "2026-10-18T17:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert!(parse_http_date("not a date").is_none());
    }

    #[test]
    fn decode_records_skips_bad_entries() {
        let mut inverted = record("bad-window");
        inverted["expiresAt"] = json!("2026-10-18T05:00:00Z");
        let records = vec![record("a"), json!({"id": "no-fields"}), inverted, record("b")];

        let decoded = decode_records(records);
        let ids: Vec<_> = decoded.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(decoded[0].is_bonus);
    }

    #[tokio::test]
    async fn http_list_reads_body_and_date() {
        let body = serde_json::to_string(&vec![record("c1")]).unwrap();
        let (base, server) = serve_once(json_response(
            "200 OK",
            Some("Sun, 18 Oct 2026 17:00:00 GMT"),
            &body,
        ))
        .await;

        let directory = HttpDirectory::new(base, Some("tok-1".into()));
        let listing = directory.list().await.unwrap();

        assert_eq!(listing.challenges.len(), 1);
        assert_eq!(listing.challenges[0].id, "c1");
        assert_eq!(
            listing.server_time,
            Some("2026-10-18T17:00:00Z".parse().unwrap())
        );

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/challenges "), "request: {request}");
        assert!(
            request.to_ascii_lowercase().contains("authorization: bearer tok-1"),
            "request: {request}"
        );
    }

    #[tokio::test]
    async fn http_list_without_token_sends_no_auth() {
        let (base, server) = serve_once(json_response("200 OK", None, "[]")).await;

        let directory = HttpDirectory::new(format!("{base}/"), None);
        let listing = directory.list().await.unwrap();
        assert!(listing.challenges.is_empty());

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/v1/challenges "));
        assert!(!request.to_ascii_lowercase().contains("authorization"));
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let (base, server) = serve_once(json_response("503 Service Unavailable", None, "{}")).await;

        let err = HttpDirectory::new(base, None).list().await.unwrap_err();
        match err {
            DirectoryError::Status { status, .. } => assert_eq!(status.as_u16(), 503),
            other => panic!("expected Status, got {other}"),
        }
        let _ = server.await;
    }

    #[tokio::test]
    async fn http_non_array_body_is_decode_error() {
        let (base, server) =
            serve_once(json_response("200 OK", None, r#"{"error":"nope"}"#)).await;

        let err = HttpDirectory::new(base, None).list().await.unwrap_err();
        assert!(matches!(err, DirectoryError::Decode { .. }), "got {err}");
        let _ = server.await;
    }

    #[tokio::test]
    async fn connection_refused_is_request_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpDirectory::new(format!("http://{addr}"), None)
            .list()
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::Request { .. }), "got {err}");
    }
}
