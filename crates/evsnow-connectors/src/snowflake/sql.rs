//! Pooled SQL sessions over the Snowflake SQL API v2.
//!
//! Checkpoint DML runs through a small [`deadpool`] pool of sessions. A
//! session is cheap (HTTP + cached JWT) but pooling bounds concurrent
//! statement submissions and gives us a liveness ping on reuse, so a dead
//! session is replaced instead of surfacing as a checkpoint failure.

use std::collections::HashMap;
use std::time::Duration;

use deadpool::managed;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use super::auth::KeyPairJwt;
use super::ConnectionProfile;
use crate::error::ConnectorError;

/// Statement execution timeout sent to the server, seconds.
const STATEMENT_TIMEOUT_SECS: u64 = 60;

/// Default pool size; one session per concurrent checkpoint saver is
/// enough, and four covers the common partition fan-out.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Errors from the SQL API transport.
#[derive(Debug, thiserror::Error)]
pub enum SqlApiError {
    /// Network-level failure; the statement may not have reached the server.
    #[error("SQL API transport error: {0}")]
    Transport(String),

    /// The server rejected the statement.
    #[error("SQL statement failed ({code}): {message}")]
    Statement {
        /// Snowflake error code, e.g. `002003` for missing objects.
        code: String,
        /// Server-provided message.
        message: String,
    },
}

impl SqlApiError {
    /// Snowflake's "object does not exist or not authorized" code.
    pub const MISSING_OBJECT_CODE: &'static str = "002003";

    /// Whether the failure means the referenced object is gone.
    #[must_use]
    pub fn is_missing_object(&self) -> bool {
        matches!(self, Self::Statement { code, .. } if code == Self::MISSING_OBJECT_CODE)
    }
}

/// A positional statement binding.
#[derive(Debug, Clone)]
pub enum Binding {
    /// Bound as `TEXT`.
    Text(String),
    /// Bound as `FIXED` (decimal rendering).
    Number(u64),
}

impl Binding {
    fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(v) => json!({ "type": "TEXT", "value": v }),
            Self::Number(v) => json!({ "type": "FIXED", "value": v.to_string() }),
        }
    }
}

/// Rows returned by a statement, every cell rendered as optional text.
#[derive(Debug, Default)]
pub struct SqlResult {
    /// Result rows, outer = row, inner = column.
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Deserialize)]
struct StatementResponse {
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// One logical session against the SQL API.
pub struct SqlSession {
    http: reqwest::Client,
    statements_url: String,
    jwt: Arc<KeyPairJwt>,
    role: Option<String>,
    warehouse: Option<String>,
}

impl SqlSession {
    fn new(http: reqwest::Client, profile: &ConnectionProfile, jwt: Arc<KeyPairJwt>) -> Self {
        Self {
            http,
            statements_url: format!(
                "{}/api/v2/statements",
                profile.account_url.trim_end_matches('/')
            ),
            jwt,
            role: profile.role.clone(),
            warehouse: profile.warehouse.clone(),
        }
    }

    /// Executes one statement with positional bindings.
    ///
    /// The profile's warehouse is attached to every request, which is what
    /// activates it for DML.
    ///
    /// # Errors
    ///
    /// [`SqlApiError::Transport`] for network failures,
    /// [`SqlApiError::Statement`] when the server rejects the statement.
    pub async fn execute(
        &self,
        statement: &str,
        bindings: &[Binding],
    ) -> Result<SqlResult, SqlApiError> {
        let token = self
            .jwt
            .token()
            .map_err(|e| SqlApiError::Transport(e.to_string()))?;

        let mut body = json!({
            "statement": statement,
            "timeout": STATEMENT_TIMEOUT_SECS,
        });
        if let Some(wh) = &self.warehouse {
            body["warehouse"] = json!(wh);
        }
        if let Some(role) = &self.role {
            body["role"] = json!(role);
        }
        if !bindings.is_empty() {
            let map: HashMap<String, serde_json::Value> = bindings
                .iter()
                .enumerate()
                .map(|(i, b)| ((i + 1).to_string(), b.to_json()))
                .collect();
            body["bindings"] = json!(map);
        }

        let response = self
            .http
            .post(&self.statements_url)
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .json(&body)
            .send()
            .await
            .map_err(|e| SqlApiError::Transport(e.to_string()))?;

        let status = response.status();
        let parsed: StatementResponse = response
            .json()
            .await
            .map_err(|e| SqlApiError::Transport(format!("malformed SQL API response: {e}")))?;

        if status.is_success() {
            debug!(rows = parsed.data.as_ref().map_or(0, Vec::len), "statement executed");
            return Ok(SqlResult {
                rows: parsed.data.unwrap_or_default(),
            });
        }

        Err(SqlApiError::Statement {
            code: parsed.code.unwrap_or_else(|| status.as_u16().to_string()),
            message: parsed
                .message
                .unwrap_or_else(|| format!("HTTP {status} with no message")),
        })
    }

    /// Liveness probe used when a pooled session is recycled.
    ///
    /// # Errors
    ///
    /// Propagates the underlying [`SqlApiError`]; the pool replaces the
    /// session on failure.
    pub async fn ping(&self) -> Result<(), SqlApiError> {
        self.execute("SELECT 1", &[]).await.map(|_| ())
    }
}

/// Deadpool manager that creates and health-checks [`SqlSession`]s.
pub struct SessionManager {
    http: reqwest::Client,
    profile: ConnectionProfile,
    jwt: Arc<KeyPairJwt>,
}

impl managed::Manager for SessionManager {
    type Type = SqlSession;
    type Error = SqlApiError;

    async fn create(&self) -> Result<SqlSession, SqlApiError> {
        Ok(SqlSession::new(
            self.http.clone(),
            &self.profile,
            Arc::clone(&self.jwt),
        ))
    }

    async fn recycle(
        &self,
        session: &mut SqlSession,
        _: &managed::Metrics,
    ) -> managed::RecycleResult<SqlApiError> {
        session.ping().await.map_err(managed::RecycleError::Backend)
    }
}

/// Bounded pool of SQL sessions.
pub type SqlPool = managed::Pool<SessionManager>;

/// Builds a session pool for `profile` with at most `max_size` sessions.
///
/// # Errors
///
/// Returns [`ConnectorError::Configuration`] when the private key is
/// invalid or the HTTP client cannot be constructed.
pub fn build_pool(profile: &ConnectionProfile, max_size: usize) -> Result<SqlPool, ConnectorError> {
    let jwt = Arc::new(KeyPairJwt::new(profile)?);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(STATEMENT_TIMEOUT_SECS + 10))
        .build()
        .map_err(|e| ConnectorError::Configuration(format!("HTTP client build failed: {e}")))?;

    let manager = SessionManager {
        http,
        profile: profile.clone(),
        jwt,
    };
    SqlPool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| ConnectorError::Configuration(format!("pool build failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_json_shapes() {
        assert_eq!(
            Binding::Text("hub".into()).to_json(),
            json!({ "type": "TEXT", "value": "hub" })
        );
        assert_eq!(
            Binding::Number(1234).to_json(),
            json!({ "type": "FIXED", "value": "1234" })
        );
    }

    #[test]
    fn test_missing_object_detection() {
        let err = SqlApiError::Statement {
            code: SqlApiError::MISSING_OBJECT_CODE.into(),
            message: "Object 'INGESTION_STATUS' does not exist".into(),
        };
        assert!(err.is_missing_object());
        assert!(!SqlApiError::Transport("reset".into()).is_missing_object());
    }

    #[test]
    fn test_statement_response_parses_minimal() {
        let parsed: StatementResponse =
            serde_json::from_str(r#"{"data": [["0", "100"]]}"#).unwrap();
        assert_eq!(parsed.data.unwrap()[0][1].as_deref(), Some("100"));

        let parsed: StatementResponse =
            serde_json::from_str(r#"{"code": "002003", "message": "gone"}"#).unwrap();
        assert_eq!(parsed.code.as_deref(), Some("002003"));
    }
}
