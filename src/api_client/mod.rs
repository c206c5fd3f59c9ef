//! External media-proxy API client
//!
//! Everything this service needs from the external product goes through the
//! [`MediaProxyApi`] trait so the engine can be exercised against an
//! in-memory fake in tests. [`MediaProxyClient`] is the reqwest-backed
//! implementation speaking the product's REST API.
//!
//! The product paginates some listings, so list responses may arrive either
//! as a bare JSON array or as `{"results": [...]}`; both shapes are
//! accepted. Individual records that fail to deserialize are logged and
//! skipped rather than failing the whole listing.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::config::ApiConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{Channel, ChannelId, PlaylistAccount, Stream, StreamId, StreamStats};
use tracing::{debug, info, warn};

#[async_trait]
pub trait MediaProxyApi: Send + Sync {
    async fn fetch_channels(&self) -> AppResult<Vec<Channel>>;
    async fn fetch_channel(&self, channel_id: ChannelId) -> AppResult<Channel>;
    async fn fetch_channel_streams(&self, channel_id: ChannelId) -> AppResult<Vec<Stream>>;
    /// Replace a channel's stream order with the given id permutation.
    async fn update_channel_streams(
        &self,
        channel_id: ChannelId,
        stream_ids: &[StreamId],
    ) -> AppResult<()>;
    async fn fetch_stream(&self, stream_id: StreamId) -> AppResult<Stream>;
    /// Merge new measurements into the stream's persisted stat blob.
    async fn patch_stream_stats(&self, stream_id: StreamId, stats: &StreamStats) -> AppResult<()>;
    async fn fetch_playlist_accounts(&self) -> AppResult<Vec<PlaylistAccount>>;
    async fn refresh_playlist_account(&self, account_id: i64) -> AppResult<()>;
    /// Ask the external system to re-run stream discovery/auto-assignment.
    async fn run_stream_discovery(&self) -> AppResult<()>;
}

pub struct MediaProxyClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl MediaProxyClient {
    pub fn new(config: &ApiConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("stream-sentinel/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json(&self, path: &str) -> AppResult<Value> {
        let response = self
            .authorize(self.client.get(self.url(path)))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn patch_json(&self, path: &str, body: &Value) -> AppResult<()> {
        self.authorize(self.client.patch(self.url(path)))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn post_json(&self, path: &str, body: &Value) -> AppResult<()> {
        self.authorize(self.client.post(self.url(path)))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Deserialize a list endpoint, tolerating pagination wrappers and
    /// skipping malformed records.
    fn parse_list<T: DeserializeOwned>(context: &str, value: Value) -> AppResult<Vec<T>> {
        let items = results_array(context, value)?;
        let mut parsed = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<T>(item) {
                Ok(record) => parsed.push(record),
                Err(e) => warn!("Skipping malformed record from {}: {}", context, e),
            }
        }
        Ok(parsed)
    }
}

/// Unwrap either `[...]` or `{"results": [...]}` into the item array.
fn results_array(context: &str, value: Value) -> AppResult<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(AppError::data_shape(
                context,
                "expected an array or an object with a 'results' array",
            )),
        },
        other => Err(AppError::data_shape(
            context,
            format!("expected an array, got {other}"),
        )),
    }
}

#[async_trait]
impl MediaProxyApi for MediaProxyClient {
    async fn fetch_channels(&self) -> AppResult<Vec<Channel>> {
        let value = self.get_json("/api/channels/channels/").await?;
        Self::parse_list("channel list", value)
    }

    async fn fetch_channel(&self, channel_id: ChannelId) -> AppResult<Channel> {
        let value = self
            .get_json(&format!("/api/channels/channels/{channel_id}/"))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn fetch_channel_streams(&self, channel_id: ChannelId) -> AppResult<Vec<Stream>> {
        let value = self
            .get_json(&format!("/api/channels/channels/{channel_id}/streams/"))
            .await?;
        Self::parse_list("channel streams", value)
    }

    async fn update_channel_streams(
        &self,
        channel_id: ChannelId,
        stream_ids: &[StreamId],
    ) -> AppResult<()> {
        debug!(
            "Updating channel {} with {} streams",
            channel_id,
            stream_ids.len()
        );
        self.patch_json(
            &format!("/api/channels/channels/{channel_id}/"),
            &serde_json::json!({ "streams": stream_ids }),
        )
        .await
    }

    async fn fetch_stream(&self, stream_id: StreamId) -> AppResult<Stream> {
        let value = self
            .get_json(&format!("/api/channels/streams/{stream_id}/"))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn patch_stream_stats(&self, stream_id: StreamId, stats: &StreamStats) -> AppResult<()> {
        // Read-modify-write: fetch the current blob so fields this probe
        // did not measure are preserved.
        let mut merged = self
            .fetch_stream(stream_id)
            .await?
            .stream_stats
            .unwrap_or_default();
        merged.merge(stats);

        info!("Updating stream {} stats", stream_id);
        self.patch_json(
            &format!("/api/channels/streams/{stream_id}/"),
            &serde_json::json!({ "stream_stats": merged }),
        )
        .await
    }

    async fn fetch_playlist_accounts(&self) -> AppResult<Vec<PlaylistAccount>> {
        let value = self.get_json("/api/m3u/accounts/").await?;
        Self::parse_list("playlist accounts", value)
    }

    async fn refresh_playlist_account(&self, account_id: i64) -> AppResult<()> {
        self.post_json(
            &format!("/api/m3u/refresh/{account_id}/"),
            &serde_json::json!({}),
        )
        .await
    }

    async fn run_stream_discovery(&self) -> AppResult<()> {
        self.post_json("/api/channels/streams/auto-match/", &serde_json::json!({}))
            .await
    }
}
