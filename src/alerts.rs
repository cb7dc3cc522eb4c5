use crate::http::build_client;
use crate::pipeline::SyncStage;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{error, warn};

/// Terminal record of a failed pipeline run, consumed immediately by the
/// alert sink and never stored.
#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub stage: SyncStage,
    pub listing_id: i64,
    pub detail: String,
    /// Set when marketplace and local state may have diverged; these need
    /// operator attention before anything is re-triggered.
    pub urgent: bool,
}

impl SyncFailure {
    pub fn message(&self) -> String {
        let headline = if self.urgent {
            "[listing sync failed: STATE DIVERGENCE]"
        } else {
            "[listing sync failed]"
        };
        format!(
            "{headline}\nstage: {stage}\nlisting: {listing}\ndetail: {detail}",
            stage = self.stage.as_str(),
            listing = self.listing_id,
            detail = self.detail,
        )
    }
}

/// Delivers failure notifications to the operations channel. Best effort:
/// the pipeline never retries or escalates a failed delivery.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, failure: &SyncFailure);
}

/// Channel Talk group-message webhook, the ops team's alert channel.
pub struct ChannelTalkNotifier {
    access_key: String,
    access_secret: String,
    group_id: String,
    http: Client,
}

impl ChannelTalkNotifier {
    pub fn from_env() -> Option<Self> {
        let access_key = std::env::var("CHANNELTALK_ACCESS_KEY").ok()?;
        let access_secret = std::env::var("CHANNELTALK_ACCESS_SECRET").ok()?;
        let group_id = std::env::var("CHANNELTALK_ALERT_GROUP_ID").ok()?;
        Some(Self {
            access_key,
            access_secret,
            group_id,
            http: build_client(),
        })
    }
}

#[async_trait]
impl AlertSink for ChannelTalkNotifier {
    async fn notify(&self, failure: &SyncFailure) {
        let url = format!(
            "https://api.channel.io/open/v5/groups/{}/messages",
            self.group_id
        );
        let body = json!({
            "blocks": [
                { "type": "text", "value": failure.message() }
            ]
        });
        let sent = self
            .http
            .post(url)
            .header("x-access-key", &self.access_key)
            .header("x-access-secret", &self.access_secret)
            .json(&body)
            .send()
            .await;
        match sent {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!(
                target = "sync.alerts",
                listing_id = failure.listing_id,
                status = %response.status(),
                "alert delivery refused"
            ),
            Err(err) => warn!(
                target = "sync.alerts",
                listing_id = failure.listing_id,
                error = %err,
                "alert delivery failed"
            ),
        }
    }
}

/// Fallback sink when no alert channel is configured; failures still land in
/// the logs at error level.
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn notify(&self, failure: &SyncFailure) {
        error!(
            target = "sync.alerts",
            stage = failure.stage.as_str(),
            listing_id = failure.listing_id,
            urgent = failure.urgent,
            "{}",
            failure.detail
        );
    }
}
