//! Snowpipe Streaming ingest client over the high-performance REST API.
//!
//! One [`SnowflakeIngestClient`] per mapping, bound to a single PIPE. Rows
//! stream through per-partition channels; a batch is durable once the
//! channel's committed offset token reaches the batch's own token.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::auth::KeyPairJwt;
use super::{channel_name, client_name, ConnectionProfile, PipeLocation};
use crate::error::{validate_identifier, ConnectorError};
use crate::ingest::{AckToken, IngestChannel, IngestClient, IngestRow};

/// How often the durable-ack wait polls the channel status endpoint.
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// HTTP timeout for individual ingest requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

fn classify_http(status: StatusCode, context: &str, body: &str) -> ConnectorError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            ConnectorError::PermanentIngest(format!("{context}: HTTP {status}: {body}"))
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            ConnectorError::PermanentIngest(format!("{context}: rejected: {body}"))
        }
        _ => ConnectorError::TransientNetwork(format!("{context}: HTTP {status}: {body}")),
    }
}

#[derive(Deserialize)]
struct ChannelStatus {
    #[serde(default)]
    last_committed_offset_token: Option<String>,
}

#[derive(Deserialize)]
struct OpenChannelResponse {
    next_continuation_token: String,
    #[serde(default)]
    channel_status: Option<ChannelStatus>,
}

#[derive(Deserialize)]
struct AppendRowsResponse {
    next_continuation_token: String,
}

#[derive(Deserialize)]
struct BulkStatusResponse {
    #[serde(default)]
    channel_statuses: HashMap<String, ChannelStatus>,
}

struct ChannelState {
    continuation_token: String,
}

/// A live per-partition streaming channel.
pub struct SnowflakeChannel {
    http: reqwest::Client,
    jwt: Arc<KeyPairJwt>,
    name: String,
    channel_url: String,
    status_url: String,
    state: Mutex<ChannelState>,
}

impl SnowflakeChannel {
    async fn committed_offset(&self) -> Result<Option<u64>, ConnectorError> {
        let token = self.jwt.token()?;
        let response = self
            .http
            .post(&self.status_url)
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .json(&json!({ "channel_names": [self.name] }))
            .send()
            .await
            .map_err(|e| ConnectorError::TransientNetwork(format!("channel status: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http(status, "channel status", &body));
        }

        let parsed: BulkStatusResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::TransientNetwork(format!("channel status body: {e}")))?;

        Ok(parsed
            .channel_statuses
            .get(&self.name)
            .and_then(|s| s.last_committed_offset_token.as_deref())
            .and_then(|t| t.parse().ok()))
    }
}

#[async_trait]
impl IngestChannel for SnowflakeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, rows: Vec<IngestRow>) -> Result<AckToken, ConnectorError> {
        let Some(last) = rows.last() else {
            return Err(ConnectorError::Configuration(
                "refusing to send an empty batch".into(),
            ));
        };
        let ack = AckToken::for_sequence(last.sequence_number);

        // NDJSON body: one row object per line.
        let mut body = String::with_capacity(rows.len() * 256);
        for row in &rows {
            let line = serde_json::to_string(row).map_err(|e| {
                ConnectorError::PermanentIngest(format!("row serialization failed: {e}"))
            })?;
            body.push_str(&line);
            body.push('\n');
        }

        let mut state = self.state.lock().await;
        let token = self.jwt.token()?;
        let response = self
            .http
            .post(format!("{}/rows", self.channel_url))
            .query(&[
                ("continuationToken", state.continuation_token.as_str()),
                ("offsetToken", ack.0.as_str()),
            ])
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| ConnectorError::TransientNetwork(format!("append rows: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http(status, "append rows", &body));
        }

        let parsed: AppendRowsResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::TransientNetwork(format!("append rows body: {e}")))?;
        state.continuation_token = parsed.next_continuation_token;

        debug!(channel = %self.name, rows = rows.len(), offset_token = %ack.0, "rows appended");
        Ok(ack)
    }

    async fn wait_for_durable(
        &self,
        token: &AckToken,
        deadline: Duration,
    ) -> Result<(), ConnectorError> {
        let target: u64 = token.0.parse().map_err(|_| {
            ConnectorError::Configuration(format!("non-numeric ack token '{}'", token.0))
        })?;
        let started = Instant::now();

        loop {
            if let Some(committed) = self.committed_offset().await? {
                if committed >= target {
                    debug!(channel = %self.name, committed, "batch durable");
                    return Ok(());
                }
            }
            if started.elapsed() >= deadline {
                return Err(ConnectorError::DurabilityTimeout {
                    channel: self.name.clone(),
                    elapsed: started.elapsed(),
                });
            }
            tokio::time::sleep(ACK_POLL_INTERVAL.min(deadline)).await;
        }
    }

    async fn close(&self) {
        let Ok(token) = self.jwt.token() else {
            return;
        };
        let result = self
            .http
            .delete(&self.channel_url)
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                info!(channel = %self.name, "channel closed");
            }
            Ok(resp) => {
                warn!(channel = %self.name, status = %resp.status(), "channel close rejected");
            }
            Err(e) => {
                warn!(channel = %self.name, error = %e, "channel close failed");
            }
        }
    }
}

/// Streaming ingest client bound to one account, user and PIPE.
pub struct SnowflakeIngestClient {
    http: reqwest::Client,
    jwt: Arc<KeyPairJwt>,
    pipe_base_url: String,
    target_table: String,
    name: String,
    suffix: String,
    channels: RwLock<HashMap<String, Arc<SnowflakeChannel>>>,
}

impl SnowflakeIngestClient {
    /// Builds a client for `pipe`, naming channels after `target_table`.
    ///
    /// `suffix` namespaces this process's channels; pass the value from
    /// [`super::client_suffix`].
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::InvalidIdentifier`] for unsafe pipe
    /// identifiers and [`ConnectorError::Configuration`] when the profile's
    /// key or the HTTP client is unusable.
    pub fn connect(
        profile: &ConnectionProfile,
        pipe: &PipeLocation,
        target_table: &str,
        suffix: String,
    ) -> Result<Self, ConnectorError> {
        validate_identifier(&pipe.database)?;
        validate_identifier(&pipe.schema)?;
        validate_identifier(&pipe.pipe)?;
        validate_identifier(target_table)?;

        let jwt = Arc::new(KeyPairJwt::new(profile)?);
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                ConnectorError::Configuration(format!("HTTP client build failed: {e}"))
            })?;

        let pipe_base_url = format!(
            "{}/v2/streaming/databases/{}/schemas/{}/pipes/{}",
            profile.account_url.trim_end_matches('/'),
            pipe.database,
            pipe.schema,
            pipe.pipe
        );
        let name = client_name(&suffix);
        info!(client = %name, pipe = %pipe.pipe, "streaming ingest client created");

        Ok(Self {
            http,
            jwt,
            pipe_base_url,
            target_table: target_table.to_string(),
            name,
            suffix,
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// The client name, `evsnow_<suffix>`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    async fn open_channel(&self, partition_id: &str) -> Result<Arc<SnowflakeChannel>, ConnectorError> {
        let channel = channel_name(&self.target_table, partition_id, &self.suffix);
        let channel_url = format!("{}/channels/{channel}", self.pipe_base_url);
        let status_url = format!("{}/channels/status", self.pipe_base_url);

        let token = self.jwt.token()?;
        let response = self
            .http
            .put(&channel_url)
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .json(&json!({ "client_name": self.name }))
            .send()
            .await
            .map_err(|e| ConnectorError::TransientNetwork(format!("open channel: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http(status, "open channel", &body));
        }

        let parsed: OpenChannelResponse = response
            .json()
            .await
            .map_err(|e| ConnectorError::TransientNetwork(format!("open channel body: {e}")))?;

        info!(
            channel = %channel,
            partition = %partition_id,
            committed = ?parsed
                .channel_status
                .as_ref()
                .and_then(|s| s.last_committed_offset_token.as_deref()),
            "channel opened"
        );

        Ok(Arc::new(SnowflakeChannel {
            http: self.http.clone(),
            jwt: Arc::clone(&self.jwt),
            name: channel,
            channel_url,
            status_url,
            state: Mutex::new(ChannelState {
                continuation_token: parsed.next_continuation_token,
            }),
        }))
    }
}

#[async_trait]
impl IngestClient for SnowflakeIngestClient {
    async fn open(&self, partition_id: &str) -> Result<Arc<dyn IngestChannel>, ConnectorError> {
        {
            let channels = self.channels.read().await;
            if let Some(existing) = channels.get(partition_id) {
                return Ok(Arc::clone(existing) as Arc<dyn IngestChannel>);
            }
        }

        let mut channels = self.channels.write().await;
        // Re-check under the write lock; another worker may have raced us.
        if let Some(existing) = channels.get(partition_id) {
            return Ok(Arc::clone(existing) as Arc<dyn IngestChannel>);
        }
        let channel = self.open_channel(partition_id).await?;
        channels.insert(partition_id.to_string(), Arc::clone(&channel));
        Ok(channel as Arc<dyn IngestChannel>)
    }

    async fn invalidate(&self, partition_id: &str) {
        let removed = self.channels.write().await.remove(partition_id);
        if let Some(channel) = removed {
            channel.close().await;
        }
    }

    async fn close(&self) {
        let channels: Vec<_> = self.channels.write().await.drain().collect();
        for (_, channel) in channels {
            channel.close().await;
        }
        info!(client = %self.name, "streaming ingest client closed");
    }
}

impl std::fmt::Debug for SnowflakeIngestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowflakeIngestClient")
            .field("name", &self.name)
            .field("target_table", &self.target_table)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_classification_permanent() {
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::BAD_REQUEST,
        ] {
            let e = classify_http(status, "open channel", "detail");
            assert!(
                matches!(e, ConnectorError::PermanentIngest(_)),
                "{status} should be permanent"
            );
        }
    }

    #[test]
    fn test_http_classification_transient() {
        for status in [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let e = classify_http(status, "append rows", "detail");
            assert!(
                matches!(e, ConnectorError::TransientNetwork(_)),
                "{status} should be transient"
            );
        }
    }

    #[test]
    fn test_status_response_parses() {
        let raw = r#"{"channel_statuses": {"EVENTS_0_ab12cd34":
            {"last_committed_offset_token": "150"}}}"#;
        let parsed: BulkStatusResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.channel_statuses["EVENTS_0_ab12cd34"]
                .last_committed_offset_token
                .as_deref(),
            Some("150")
        );
    }
}
