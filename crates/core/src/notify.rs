//! Shortlist delivery.

use crate::domain::shortlist::Shortlist;
use anyhow::Context;
use std::time::Duration;

#[async_trait::async_trait]
pub trait ShortlistSink: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, shortlist: &Shortlist) -> anyhow::Result<()>;
}

/// Writes the shortlist to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait::async_trait]
impl ShortlistSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn publish(&self, shortlist: &Shortlist) -> anyhow::Result<()> {
        let as_of_date = shortlist.as_of_date;
        for e in &shortlist.entries {
            tracing::info!(
                %as_of_date,
                part2_rank = e.part2_rank,
                ticker = %e.ticker,
                composite_rank = e.composite_rank,
                weighted_rank = e.weighted_rank,
                status = e.status.as_str(),
                "shortlist entry"
            );
        }
        for d in &shortlist.dropped {
            tracing::info!(
                %as_of_date,
                ticker = %d.ticker,
                previous_part2_rank = d.previous_part2_rank,
                reason = d.reason.as_str(),
                "dropped from shortlist"
            );
        }
        Ok(())
    }
}

/// POSTs the shortlist as JSON.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait::async_trait]
impl ShortlistSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn publish(&self, shortlist: &Shortlist) -> anyhow::Result<()> {
        let res = self
            .http
            .post(&self.url)
            .json(shortlist)
            .send()
            .await
            .context("webhook request failed")?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("webhook HTTP {status}: {body}");
        }
        Ok(())
    }
}

/// Publishes to every sink. A failing sink is logged and does not stop the
/// others; returns the number of sinks that failed.
pub async fn publish_all(sinks: &[Box<dyn ShortlistSink>], shortlist: &Shortlist) -> usize {
    let mut failed = 0;
    for sink in sinks {
        if let Err(err) = sink.publish(shortlist).await {
            failed += 1;
            tracing::error!(
                as_of_date = %shortlist.as_of_date,
                sink = sink.name(),
                error = %err,
                "shortlist sink failed"
            );
        }
    }
    failed
}
