//! Query API client
//!
//! The game server evaluates a Lua snippet POSTed to `/exec.lua` and answers
//! with the plain-text result, or with `{"ERROR": "..."}` when evaluation
//! failed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

/// Path of the evaluation endpoint
pub const EXEC_PATH: &str = "/exec.lua";

/// Why a query produced no data
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Server unreachable (connect failure, timeout, broken response)
    #[error("query transport failed: {0}")]
    Transport(String),
    /// Server is up but has no game loaded
    #[error("no active game session: {0}")]
    NoSession(String),
    #[error("evaluation error: {0}")]
    Evaluation(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
}

impl QueryError {
    pub fn is_transport(&self) -> bool {
        matches!(self, QueryError::Transport(_))
    }

    pub fn is_no_session(&self) -> bool {
        matches!(self, QueryError::NoSession(_))
    }
}

/// Something that can evaluate an expression on the game server
pub trait QueryTransport: Send + Sync {
    fn evaluate(&self, expression: &str) -> impl Future<Output = Result<String, QueryError>> + Send;
}

impl<T: QueryTransport> QueryTransport for Arc<T> {
    fn evaluate(&self, expression: &str) -> impl Future<Output = Result<String, QueryError>> + Send {
        (**self).evaluate(expression)
    }
}

/// `reqwest` transport against a live server
#[derive(Debug, Clone)]
pub struct ExecClient {
    client: Client,
    url: String,
}

impl ExecClient {
    /// `base_url` like `http://host:8080`; `timeout` bounds each query
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QueryError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| QueryError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), EXEC_PATH),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl QueryTransport for ExecClient {
    async fn evaluate(&self, expression: &str) -> Result<String, QueryError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(expression.to_owned())
            .send()
            .await
            .map_err(|e| QueryError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| QueryError::Transport(format!("failed to read response: {}", e)))?;

        classify_response(status, &body)
    }
}

/// Turn a raw HTTP status and body into a result
pub fn classify_response(status: u16, body: &str) -> Result<String, QueryError> {
    if let Some(message) = error_message(body) {
        return Err(classify_error(&message));
    }
    if status != 200 {
        debug!("exec.lua returned HTTP {}", status);
        return Err(QueryError::Http {
            status,
            body: body.trim().chars().take(200).collect(),
        });
    }
    Ok(body.trim().to_string())
}

/// Extract the message of an `{"ERROR": ...}` body
fn error_message(body: &str) -> Option<String> {
    let trimmed = body.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
    match value.get("ERROR")? {
        serde_json::Value::String(message) => Some(message.clone()),
        other => Some(other.to_string()),
    }
}

/// Split server errors into "no session" and everything else
pub fn classify_error(message: &str) -> QueryError {
    let lower = message.to_ascii_lowercase();
    let no_session = ["no game", "no active", "no scenario", "not running", "no session"]
        .iter()
        .any(|marker| lower.contains(marker));

    if no_session {
        QueryError::NoSession(message.to_string())
    } else {
        QueryError::Evaluation(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_result() {
        assert_eq!(classify_response(200, "42.5\n"), Ok("42.5".to_string()));
        assert_eq!(classify_response(200, ""), Ok(String::new()));
    }

    #[test]
    fn test_error_body_classification() {
        let no_game = classify_response(200, r#"{"ERROR": "No game active"}"#);
        assert!(matches!(no_game, Err(QueryError::NoSession(_))));

        let eval = classify_response(200, r#"{"ERROR": "attempt to index a nil value"}"#);
        assert!(matches!(eval, Err(QueryError::Evaluation(_))));

        // Error body wins over the status code
        let both = classify_response(500, r#"{"ERROR": "no active scenario"}"#);
        assert!(matches!(both, Err(QueryError::NoSession(_))));
    }

    #[test]
    fn test_http_status() {
        let err = classify_response(404, "not found").unwrap_err();
        assert_eq!(
            err,
            QueryError::Http {
                status: 404,
                body: "not found".to_string()
            }
        );
        assert!(!err.is_transport());
    }

    #[test]
    fn test_json_result_without_error_is_data() {
        assert_eq!(classify_response(200, r#"{"x": 1}"#), Ok(r#"{"x": 1}"#.to_string()));
    }

    #[test]
    fn test_exec_url() {
        let client = ExecClient::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.url(), "http://localhost:8080/exec.lua");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        // Bind then drop so the port is very likely closed
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = ExecClient::new(&format!("http://127.0.0.1:{}", port), Duration::from_millis(500)).unwrap();
        let err = client.evaluate("return 1").await.unwrap_err();
        assert!(err.is_transport());
    }
}
