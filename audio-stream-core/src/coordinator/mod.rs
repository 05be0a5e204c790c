//! Debounced, serialized restarts for hardware endpoint changes.
//!
//! A single physical device swap fires several native notifications
//! within milliseconds; this module collapses them into one coordinated
//! restart and guarantees at most one restart is in flight.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capture::FirstFrameHook;
use crate::models::audio::SourceKind;
use crate::models::error::CaptureError;

/// Performs the actual source teardown/bring-up on the coordinator's
/// behalf. Implemented by the session over its managed sources; kept as
/// a trait so restart sequencing is testable without real devices.
#[async_trait]
pub trait RestartExecutor: Send + Sync {
    /// Tear the source down ahead of the settle delay.
    async fn begin_restart(&self, source: SourceKind);

    /// Bring the source back up, on the configured device or, with
    /// `fallback_default`, on the platform default endpoint.
    async fn complete_restart(
        &self,
        source: SourceKind,
        fallback_default: bool,
    ) -> Result<(), CaptureError>;

    /// Even the default endpoint failed; the source stays down but the
    /// session continues.
    async fn mark_degraded(&self, source: SourceKind);
}

/// Timing and retry policy for coordinated restarts.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long to collect further notifications before restarting.
    pub debounce_window: Duration,
    /// Pause between source teardown and bring-up.
    pub settle_delay: Duration,
    /// Delay after each failed attempt; the length is the attempt budget.
    pub retry_backoff: Vec<Duration>,
    /// Cap on one bring-up attempt before it counts as failed.
    pub attempt_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_millis(400),
            settle_delay: Duration::from_millis(200),
            retry_backoff: vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(1500),
            ],
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

/// Restart bookkeeping, readable at any time.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    /// Monotonic count of device-change notifications received.
    pub device_changes: AtomicU64,
    /// Coordinated restart sequences completed.
    pub restarts_completed: AtomicU64,
    /// Restarts that ended on the platform default device.
    pub fallbacks: AtomicU64,
    /// Duration of the most recent restart sequence, in milliseconds.
    pub last_restart_ms: AtomicU64,
}

enum Command {
    Restart { source: SourceKind, reason: String },
    Shutdown,
}

/// Serializes device-change notifications from all sources into single
/// coordinated restarts. Explicitly constructed and owned by the
/// session, so concurrent sessions each get their own coordinator.
pub struct DeviceChangeCoordinator {
    cmd_tx: mpsc::UnboundedSender<Command>,
    paused: Arc<AtomicBool>,
    metrics: Arc<CoordinatorMetrics>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceChangeCoordinator {
    pub fn new(config: CoordinatorConfig, executor: Arc<dyn RestartExecutor>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let paused = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(CoordinatorMetrics::default());

        let task = tokio::spawn(run(
            config,
            executor,
            cmd_rx,
            Arc::clone(&paused),
            Arc::clone(&metrics),
        ));

        Self {
            cmd_tx,
            paused,
            metrics,
            task: Mutex::new(Some(task)),
        }
    }

    /// Schedule a debounced restart of `source`. Repeat calls within the
    /// debounce window coalesce into one restart; calls during a running
    /// restart queue behind it.
    pub fn request_restart(&self, source: SourceKind, reason: &str) {
        self.metrics.device_changes.fetch_add(1, Ordering::Relaxed);
        let _ = self.cmd_tx.send(Command::Restart {
            source,
            reason: reason.to_string(),
        });
    }

    /// Gate consulted by every capture callback before forwarding frames.
    pub fn pause_gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn pause_all(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            log::info!("audio delivery paused");
        }
    }

    pub fn resume_all(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            log::info!("audio delivery resumed");
        }
    }

    /// Hook for managed sources: the first valid post-restart frame
    /// releases the pause gate.
    pub fn first_frame_hook(&self) -> FirstFrameHook {
        let paused = Arc::clone(&self.paused);
        Arc::new(move |source| {
            if paused.swap(false, Ordering::SeqCst) {
                log::info!("{}: first frame after restart, resuming delivery", source);
            }
        })
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    /// Cancel any in-flight restart and stop the coordinator task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        self.resume_all();
    }
}

async fn run(
    config: CoordinatorConfig,
    executor: Arc<dyn RestartExecutor>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    paused: Arc<AtomicBool>,
    metrics: Arc<CoordinatorMetrics>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let mut affected = BTreeSet::new();
        match cmd {
            Command::Shutdown => return,
            Command::Restart { source, reason } => {
                log::info!("{}: device change ({}), debouncing", source, reason);
                affected.insert(source);
            }
        }

        // Collect everything else arriving inside the debounce window.
        let deadline = tokio::time::sleep(config.debounce_window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                cmd = cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => return,
                    Some(Command::Restart { source, reason }) => {
                        log::debug!("{}: coalescing device change ({})", source, reason);
                        affected.insert(source);
                    }
                },
            }
        }

        restart_sources(&config, executor.as_ref(), &affected, &paused, &metrics).await;
    }
}

/// One full restart sequence: pause, stop, settle, bring-up with bounded
/// retries, fallback to the default device on exhaustion. Resume happens
/// on the first valid frame; if nothing came back up the gate is
/// released here so unaffected sources keep flowing.
async fn restart_sources(
    config: &CoordinatorConfig,
    executor: &dyn RestartExecutor,
    affected: &BTreeSet<SourceKind>,
    paused: &AtomicBool,
    metrics: &CoordinatorMetrics,
) {
    let started = Instant::now();
    paused.store(true, Ordering::SeqCst);

    for &source in affected {
        executor.begin_restart(source).await;
    }
    tokio::time::sleep(config.settle_delay).await;

    let mut recovered = 0usize;
    for &source in affected {
        if bring_up(config, executor, source).await {
            recovered += 1;
        } else {
            metrics.fallbacks.fetch_add(1, Ordering::Relaxed);
            match executor.complete_restart(source, true).await {
                Ok(()) => {
                    log::warn!("{}: recovered on platform default device", source);
                    recovered += 1;
                }
                Err(e) => {
                    log::error!("{}: default device failed too, continuing degraded: {}", source, e);
                    executor.mark_degraded(source).await;
                }
            }
        }
    }

    let elapsed = started.elapsed();
    metrics.restarts_completed.fetch_add(1, Ordering::Relaxed);
    metrics
        .last_restart_ms
        .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    log::info!(
        "restart of {} source(s) finished in {} ms",
        affected.len(),
        elapsed.as_millis()
    );

    if recovered == 0 {
        // No source will ever produce the resuming first frame.
        paused.store(false, Ordering::SeqCst);
    }
}

/// Attempt bring-up on the configured device with backoff. Returns false
/// once the attempt budget is spent.
async fn bring_up(
    config: &CoordinatorConfig,
    executor: &dyn RestartExecutor,
    source: SourceKind,
) -> bool {
    for (attempt, delay) in config.retry_backoff.iter().enumerate() {
        let result = tokio::time::timeout(
            config.attempt_timeout,
            executor.complete_restart(source, false),
        )
        .await
        .map_err(|_| CaptureError::DeviceChangeTimeout(format!("{} bring-up timed out", source)))
        .and_then(|inner| inner);

        match result {
            Ok(()) => {
                log::info!("{}: restarted (attempt {})", source, attempt + 1);
                return true;
            }
            Err(e) => {
                log::warn!(
                    "{}: restart attempt {} failed: {}, retrying in {:?}",
                    source,
                    attempt + 1,
                    e,
                    delay
                );
                tokio::time::sleep(*delay).await;
            }
        }
    }
    false
}
