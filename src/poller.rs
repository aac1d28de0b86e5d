//! Periodic fetch-and-display loop.
//!
//! Each tick fetches the endpoint once. A 200 response replaces the
//! screen content with the raw body; anything else leaves the screen as
//! it was. The next tick starts a fixed delay after the previous one
//! completed, so ticks never overlap and the effective spacing is
//! `interval + latency`.

use crate::config::PollerConfig;
use crossterm::{
    cursor::MoveTo,
    queue,
    style::Print,
    terminal::{Clear, ClearType},
};
use reqwest::StatusCode;
use std::fmt;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Display region the poller paints into.
pub trait Screen {
    fn show(&mut self, text: &str);
}

/// Repaints a terminal (or any writer): clear, cursor home, text.
pub struct TerminalScreen<W: Write> {
    out: W,
}

impl TerminalScreen<std::io::Stdout> {
    pub fn stdout() -> Self {
        TerminalScreen::new(std::io::stdout())
    }
}

impl<W: Write> TerminalScreen<W> {
    pub fn new(out: W) -> Self {
        TerminalScreen { out }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Screen for TerminalScreen<W> {
    fn show(&mut self, text: &str) {
        let painted = queue!(self.out, Clear(ClearType::All), MoveTo(0, 0), Print(text))
            .and_then(|_| self.out.flush());
        if let Err(e) = painted {
            debug!(error = %e, "Failed to paint screen");
        }
    }
}

/// Why a tick did not update the screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    /// Endpoint answered with a non-200 status.
    Status(u16),
    /// Request could not be completed.
    Network(String),
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Status(code) => write!(f, "unexpected status {code}"),
            FetchFailure::Network(reason) => write!(f, "network error: {reason}"),
        }
    }
}

/// Result of one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Screen now shows a new body.
    Updated,
    /// 200 with the body already on screen.
    Unchanged,
    /// Screen kept its previous content.
    Failed(FetchFailure),
}

/// Tick counters returned when the loop stops
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollReport {
    pub ticks: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failed: u64,
}

impl PollReport {
    fn record(&mut self, outcome: &TickOutcome) {
        self.ticks += 1;
        match outcome {
            TickOutcome::Updated => self.updated += 1,
            TickOutcome::Unchanged => self.unchanged += 1,
            TickOutcome::Failed(_) => self.failed += 1,
        }
    }
}

pub struct Poller<S> {
    client: reqwest::Client,
    endpoint: String,
    interval: Duration,
    last_body: Option<String>,
    screen: S,
}

impl<S: Screen> Poller<S> {
    pub fn new(config: &PollerConfig, screen: S) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Poller {
            client,
            endpoint: config.url.clone(),
            interval: config.interval(),
            last_body: None,
            screen,
        })
    }

    #[cfg(test)]
    pub fn last_body(&self) -> Option<&str> {
        self.last_body.as_deref()
    }

    #[cfg(test)]
    pub fn screen(&self) -> &S {
        &self.screen
    }

    /// Fetch once and update the screen on success.
    pub async fn tick(&mut self) -> TickOutcome {
        let outcome = match self.fetch().await {
            Ok(body) if self.last_body.as_deref() == Some(body.as_str()) => TickOutcome::Unchanged,
            Ok(body) => {
                self.screen.show(&body);
                self.last_body = Some(body);
                TickOutcome::Updated
            }
            Err(failure) => TickOutcome::Failed(failure),
        };

        match &outcome {
            TickOutcome::Failed(failure) => {
                debug!(endpoint = %self.endpoint, %failure, "Refresh failed")
            }
            other => trace!(endpoint = %self.endpoint, outcome = ?other, "Refreshed"),
        }

        outcome
    }

    /// Tick until `cancel` fires, waiting `interval` before each tick.
    pub async fn run(&mut self, cancel: CancellationToken) -> PollReport {
        let mut report = PollReport::default();

        info!(
            endpoint = %self.endpoint,
            interval_ms = self.interval.as_millis() as u64,
            "Poller started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.tick() => outcome,
            };
            report.record(&outcome);
        }

        info!(
            ticks = report.ticks,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            "Poller stopped"
        );
        report
    }

    async fn fetch(&self) -> Result<String, FetchFailure> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| FetchFailure::Network(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| FetchFailure::Network(e.to_string()))
    }
}
