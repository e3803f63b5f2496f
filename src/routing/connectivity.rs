//! Connectivity classification from a periodic latency probe.
//!
//! Jobs never wait on a probe: they read the last published classification.
//! A classification older than `stale_after` reads as Offline.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectivityConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Online,
    Slow,
    Offline,
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connectivity::Online => write!(f, "online"),
            Connectivity::Slow => write!(f, "slow"),
            Connectivity::Offline => write!(f, "offline"),
        }
    }
}

pub trait ConnectivitySource: Send + Sync {
    fn last_classification(&self) -> Connectivity;
}

/// A classification set by hand. Used when no probe is configured.
#[derive(Debug)]
pub struct FixedConnectivity(RwLock<Connectivity>);

impl FixedConnectivity {
    pub fn new(value: Connectivity) -> Self {
        Self(RwLock::new(value))
    }

    pub fn set(&self, value: Connectivity) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

impl ConnectivitySource for FixedConnectivity {
    fn last_classification(&self) -> Connectivity {
        *self.0.read().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe target unreachable: {0}")]
    Unreachable(String),

    #[error("Probe returned status {0}")]
    Status(u16),
}

/// Measures one round trip to the remote side.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn probe(&self) -> Result<Duration, ProbeError>;
}

/// Times a GET against a health URL.
#[derive(Debug, Clone)]
pub struct HttpLatencyProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpLatencyProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl LatencyProbe for HttpLatencyProbe {
    async fn probe(&self) -> Result<Duration, ProbeError> {
        let started = Instant::now();
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status().as_u16()));
        }
        Ok(started.elapsed())
    }
}

/// Classify one probe outcome.
pub fn classify(outcome: &Result<Duration, ProbeError>, slow_threshold: Duration) -> Connectivity {
    match outcome {
        Err(_) => Connectivity::Offline,
        Ok(rtt) if *rtt >= slow_threshold => Connectivity::Slow,
        Ok(_) => Connectivity::Online,
    }
}

/// Most recent probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub classification: Connectivity,
    pub latency: Option<Duration>,
    pub measured_at: Option<Instant>,
}

impl Snapshot {
    fn unmeasured() -> Self {
        Self {
            classification: Connectivity::Offline,
            latency: None,
            measured_at: None,
        }
    }
}

pub struct ConnectivityMonitor {
    probe: Arc<dyn LatencyProbe>,
    interval: Duration,
    slow_threshold: Duration,
    stale_after: Duration,
    state: watch::Sender<Snapshot>,
}

impl ConnectivityMonitor {
    pub fn new(probe: Arc<dyn LatencyProbe>, config: &ConnectivityConfig) -> Self {
        let (state, _) = watch::channel(Snapshot::unmeasured());
        Self {
            probe,
            interval: Duration::from_millis(config.probe_interval_ms.max(1)),
            slow_threshold: Duration::from_millis(config.slow_threshold_ms),
            stale_after: Duration::from_millis(config.stale_after_ms),
            state,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    /// Probe once and publish the result.
    pub async fn refresh(&self) -> Connectivity {
        let outcome = self.probe.probe().await;
        let classification = classify(&outcome, self.slow_threshold);
        let latency = outcome.as_ref().ok().copied();
        match &outcome {
            Ok(rtt) => tracing::debug!(?rtt, %classification, "Connectivity probe"),
            Err(e) => tracing::debug!(error = %e, "Connectivity probe failed"),
        }

        let previous = self.state.send_replace(Snapshot {
            classification,
            latency,
            measured_at: Some(Instant::now()),
        });
        if previous.classification != classification {
            tracing::info!(from = %previous.classification, to = %classification, "Connectivity changed");
        }
        classification
    }

    /// Probe on a fixed cadence until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.refresh().await;
                }
            }
        }
        tracing::debug!("Connectivity monitor stopped");
    }
}

impl ConnectivitySource for ConnectivityMonitor {
    fn last_classification(&self) -> Connectivity {
        let snapshot = self.snapshot();
        match snapshot.measured_at {
            Some(at) if at.elapsed() <= self.stale_after => snapshot.classification,
            _ => Connectivity::Offline,
        }
    }
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("interval", &self.interval)
            .field("slow_threshold", &self.slow_threshold)
            .field("stale_after", &self.stale_after)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Scripted(Mutex<Vec<Result<Duration, ProbeError>>>);

    #[async_trait]
    impl LatencyProbe for Scripted {
        async fn probe(&self) -> Result<Duration, ProbeError> {
            let mut outcomes = self.0.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes[0].clone()
            }
        }
    }

    fn monitor(outcomes: Vec<Result<Duration, ProbeError>>, stale_after_ms: u64) -> ConnectivityMonitor {
        let config = ConnectivityConfig {
            probe_url: None,
            probe_interval_ms: 10,
            slow_threshold_ms: 100,
            stale_after_ms,
        };
        ConnectivityMonitor::new(Arc::new(Scripted(Mutex::new(outcomes))), &config)
    }

    #[test]
    fn classification_thresholds() {
        let slow = Duration::from_millis(100);
        assert_eq!(classify(&Ok(Duration::from_millis(5)), slow), Connectivity::Online);
        assert_eq!(classify(&Ok(Duration::from_millis(100)), slow), Connectivity::Slow);
        assert_eq!(
            classify(&Err(ProbeError::Status(503)), slow),
            Connectivity::Offline
        );
    }

    #[test]
    fn unmeasured_monitor_reads_offline() {
        let m = monitor(vec![Ok(Duration::from_millis(1))], 10_000);
        assert_eq!(m.last_classification(), Connectivity::Offline);
    }

    #[tokio::test]
    async fn refresh_publishes_classification() {
        let m = monitor(
            vec![Ok(Duration::from_millis(1)), Ok(Duration::from_millis(500))],
            10_000,
        );
        let mut rx = m.subscribe();
        assert_eq!(m.refresh().await, Connectivity::Online);
        assert_eq!(m.last_classification(), Connectivity::Online);
        assert!(rx.has_changed().unwrap());
        assert_eq!(m.refresh().await, Connectivity::Slow);
        assert_eq!(rx.borrow_and_update().classification, Connectivity::Slow);
    }

    #[tokio::test]
    async fn stale_classification_degrades_to_offline() {
        let m = monitor(vec![Ok(Duration::from_millis(1))], 20);
        m.refresh().await;
        assert_eq!(m.last_classification(), Connectivity::Online);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(m.last_classification(), Connectivity::Offline);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let m = Arc::new(monitor(vec![Ok(Duration::from_millis(1))], 10_000));
        let token = CancellationToken::new();
        let task = tokio::spawn({
            let m = m.clone();
            let token = token.clone();
            async move { m.run(token).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(m.last_classification(), Connectivity::Online);
        token.cancel();
        task.await.unwrap();
    }

    #[test]
    fn fixed_source_can_change() {
        let fixed = FixedConnectivity::new(Connectivity::Online);
        fixed.set(Connectivity::Slow);
        assert_eq!(fixed.last_classification(), Connectivity::Slow);
    }
}
