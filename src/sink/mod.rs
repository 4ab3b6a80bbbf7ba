//! Output sinks: where formatted messages end up.
//!
//! The router only needs "accept a bounded text message and report success or
//! failure", modelled by [`Sink`]. [`DiscordSink`] posts to a channel through
//! the Discord REST API; [`StdoutSink`] prints, for dry runs.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::config::ValidatedSink;

const DISCORD_API: &str = "https://discord.com/api/v10";
const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink rejected message: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("rate limited; retry after {0:?}")]
    RateLimited(Duration),
    #[error("stdout write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one message of at most the sink's size limit.
    async fn send(&self, text: &str) -> Result<(), SinkError>;

    fn name(&self) -> &'static str;
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

pub struct DiscordSink {
    client: reqwest::Client,
    token: String,
    url: String,
}

impl DiscordSink {
    pub fn new(creds: &ValidatedSink) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .user_agent(concat!("meshcord/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            token: creds.token.clone(),
            url: format!("{}/channels/{}/messages", DISCORD_API, creds.channel_id),
        })
    }

    async fn post(&self, text: &str) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&serde_json::json!({ "content": text }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = resp
                .json::<RateLimitBody>()
                .await
                .ok()
                .and_then(|b| Duration::try_from_secs_f64(b.retry_after).ok())
                .unwrap_or(Duration::from_secs(1));
            return Err(SinkError::RateLimited(wait));
        }
        let body = resp.text().await.unwrap_or_default();
        Err(SinkError::Rejected {
            status: status.as_u16(),
            body: crate::logutil::truncate_for_log(&body, 200),
        })
    }
}

#[async_trait]
impl Sink for DiscordSink {
    async fn send(&self, text: &str) -> Result<(), SinkError> {
        match self.post(text).await {
            Err(SinkError::RateLimited(wait)) if wait <= MAX_RATE_LIMIT_WAIT => {
                warn!("Discord rate limit hit, retrying in {:?}", wait);
                tokio::time::sleep(wait).await;
                self.post(text).await
            }
            other => other,
        }
    }

    fn name(&self) -> &'static str {
        "discord"
    }
}

/// Prints messages instead of delivering them (`start --dry-run`).
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    async fn send(&self, text: &str) -> Result<(), SinkError> {
        use tokio::io::AsyncWriteExt;
        let mut out = tokio::io::stdout();
        out.write_all(text.as_bytes()).await?;
        out.write_all(b"\n---\n").await?;
        out.flush().await?;
        debug!("dry-run: printed {} chars", text.chars().count());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdout"
    }
}
