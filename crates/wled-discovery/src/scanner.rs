//! Batch subnet scanner
//!
//! A session walks the enumerated addresses in fixed-size batches. Every
//! address in a batch is probed concurrently and the batch drains fully
//! before a short delay and the next batch. Progress is published as a
//! snapshot after each probe resolves.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wled_core::{normalize_address, UNKNOWN_DEVICE_NAME};

use crate::enumerate::{plan, SpecError, MAX_SCAN_ADDRESSES};
use crate::events::ScanEvent;
use crate::probe::{Probe, ProbeOutcome};
use crate::reconcile::Reconciler;

pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_BATCH_DELAY_MS: u64 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error(transparent)]
    InvalidInput(#[from] SpecError),
    #[error("A scan is already running")]
    AlreadyScanning,
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub batch_size: usize,
    /// Pause between batches
    pub batch_delay: Duration,
    pub max_addresses: usize,
    /// Forward confirmed devices to the reconciler as they are found
    pub auto_add: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: Duration::from_millis(DEFAULT_BATCH_DELAY_MS),
            max_addresses: MAX_SCAN_ADDRESSES,
            auto_add: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Scanning,
    Completed,
    Cancelled,
}

/// Snapshot of the current (or last) scan session
#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub state: ScanState,
    pub spec: Option<String>,
    pub total: usize,
    pub checked: usize,
    pub found: Vec<ProbeOutcome>,
    /// Validation error from the last start attempt
    pub error: Option<String>,
}

impl ScanProgress {
    fn idle() -> Self {
        Self {
            state: ScanState::Idle,
            spec: None,
            total: 0,
            checked: 0,
            found: Vec::new(),
            error: None,
        }
    }

    /// Fraction of addresses checked, 0.0 to 1.0
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.checked as f64 / self.total as f64
        }
    }
}

pub struct SubnetScanner {
    probe: Arc<dyn Probe>,
    reconciler: Arc<Reconciler>,
    config: ScanConfig,
    progress: watch::Sender<ScanProgress>,
    events: broadcast::Sender<ScanEvent>,
    /// Cancellation token of the running session; also the start/stop gate
    session: Mutex<Option<CancellationToken>>,
}

impl SubnetScanner {
    pub fn new(probe: Arc<dyn Probe>, reconciler: Arc<Reconciler>, config: ScanConfig) -> Self {
        let (progress, _) = watch::channel(ScanProgress::idle());
        let (events, _) = broadcast::channel(256);
        Self {
            probe,
            reconciler,
            config,
            progress,
            events,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Current progress snapshot
    pub fn progress(&self) -> ScanProgress {
        self.progress.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ScanProgress> {
        self.progress.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub fn is_scanning(&self) -> bool {
        self.progress.borrow().state == ScanState::Scanning
    }

    /// Validate `spec` and start a session in the background
    ///
    /// Returns the number of addresses to probe. Invalid input is reported
    /// without entering `Scanning` and without any network activity.
    pub async fn start_scan(self: &Arc<Self>, spec: &str) -> Result<usize, ScanError> {
        let mut session = self.session.lock().await;
        if self.is_scanning() {
            return Err(ScanError::AlreadyScanning);
        }

        let addresses = match plan(spec, self.config.max_addresses) {
            Ok(addresses) => addresses,
            Err(e) => {
                debug!(spec = %spec, error = %e, "Rejected scan specification");
                self.progress.send_replace(ScanProgress {
                    spec: Some(spec.to_string()),
                    error: Some(e.to_string()),
                    ..ScanProgress::idle()
                });
                return Err(e.into());
            }
        };

        let total = addresses.len();
        let token = CancellationToken::new();
        self.progress.send_replace(ScanProgress {
            state: ScanState::Scanning,
            spec: Some(spec.to_string()),
            total,
            ..ScanProgress::idle()
        });
        let _ = self.events.send(ScanEvent::Started {
            spec: spec.to_string(),
            total,
        });
        info!(spec = %spec, total, "Scan started");

        let scanner = Arc::clone(self);
        let cancel = token.clone();
        tokio::spawn(async move { scanner.run(addresses, cancel).await });

        *session = Some(token);
        Ok(total)
    }

    /// Request cancellation of the running session; in-flight probes finish
    pub async fn stop_scan(&self) -> bool {
        let session = self.session.lock().await;
        match session.as_ref() {
            Some(token) if self.is_scanning() => {
                info!("Scan cancellation requested");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait until no session is running
    pub async fn wait(&self) -> ScanProgress {
        let mut rx = self.progress.subscribe();
        let result = rx
            .wait_for(|p| p.state != ScanState::Scanning)
            .await
            .map(|p| p.clone());
        match result {
            Ok(progress) => progress,
            Err(_) => self.progress(),
        }
    }

    /// Stop any running session, let it drain, then start `spec`
    pub async fn restart_scan(self: &Arc<Self>, spec: &str) -> Result<usize, ScanError> {
        if self.stop_scan().await {
            self.wait().await;
        }
        self.start_scan(spec).await
    }

    /// Forward the chosen hits of the latest session to the reconciler
    pub async fn add_selected(&self, addresses: &[String]) -> usize {
        let wanted: Vec<String> = addresses.iter().map(|a| normalize_address(a)).collect();
        let selected: Vec<ProbeOutcome> = self
            .progress
            .borrow()
            .found
            .iter()
            .filter(|o| wanted.contains(&normalize_address(&o.address)))
            .cloned()
            .collect();

        let mut added = 0;
        for outcome in &selected {
            if self.forward(outcome).await {
                added += 1;
            }
        }
        added
    }

    async fn forward(&self, outcome: &ProbeOutcome) -> bool {
        let name = outcome
            .display_name
            .as_deref()
            .unwrap_or(UNKNOWN_DEVICE_NAME);
        match self
            .reconciler
            .reconcile(&outcome.address, name, outcome.info.as_ref())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(address = %outcome.address, error = %e, "Failed to reconcile scanned device");
                false
            }
        }
    }

    async fn run(self: Arc<Self>, addresses: Vec<String>, cancel: CancellationToken) {
        let batch_size = self.config.batch_size.max(1);
        let mut checked = 0usize;
        let mut found = 0usize;
        let mut cancelled = false;
        // Reconciles run beside the probes so a slow store never holds up progress
        let mut forwards = JoinSet::new();

        for (index, batch) in addresses.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            if index > 0 && !self.config.batch_delay.is_zero() {
                let interrupted = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = tokio::time::sleep(self.config.batch_delay) => false,
                };
                if interrupted {
                    cancelled = true;
                    break;
                }
            }

            let mut probes = JoinSet::new();
            for address in batch {
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let probe = Arc::clone(&self.probe);
                let address = address.clone();
                probes.spawn(async move { probe.probe(&address).await });
            }
            debug!(batch = index, dispatched = probes.len(), "Probing batch");

            while let Some(joined) = probes.join_next().await {
                checked += 1;
                let hit = match joined {
                    Ok(outcome) if outcome.is_target_device => Some(outcome),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Probe task failed");
                        None
                    }
                };

                match hit {
                    Some(outcome) => {
                        found += 1;
                        info!(address = %outcome.address, name = ?outcome.display_name, "Found WLED device");
                        self.progress.send_modify(|p| {
                            p.checked = checked;
                            p.found.push(outcome.clone());
                        });
                        let _ = self.events.send(ScanEvent::DeviceFound(outcome.clone()));
                        if self.config.auto_add {
                            let scanner = Arc::clone(&self);
                            forwards.spawn(async move { scanner.forward(&outcome).await });
                        }
                    }
                    None => self.progress.send_modify(|p| p.checked = checked),
                }
            }

            if cancelled {
                break;
            }
        }

        // Hits already found are still recorded after a cancel
        while let Some(joined) = forwards.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Reconcile task failed");
            }
        }

        let state = if cancelled {
            ScanState::Cancelled
        } else {
            ScanState::Completed
        };
        self.progress.send_modify(|p| p.state = state);
        let _ = self.events.send(ScanEvent::Finished {
            state,
            checked,
            found,
        });
        info!(state = ?state, checked, found, "Scan finished");
    }
}
