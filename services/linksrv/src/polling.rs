//! Polling driver
//!
//! Runs `read_data()` on a fixed interval with a fixed block list and hands
//! every result to the telemetry sink. Failures are logged and broadcast as
//! [`PollEvent`]s; the timer only stops through [`PollingHandle::stop`],
//! which also disconnects the connector.
//!
//! ```text
//! tick ──try_lock──► read_data(blocks) ──► TelemetryBatch ──► sink.store()
//!   │                      │                                      │
//!   └─busy: CycleSkipped   └─first disconnected: ConnectionWarning └─err: StorageFailed
//! ```

use errors::{ErrorInfo, PlcLinkErrorTrait};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};

use crate::block::ReadBlock;
use crate::connector::Connector;
use crate::error::LinkError;
use crate::storage::{TelemetryBatch, TelemetrySink};

/// Polling driver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Call `connect()` before the first tick
    #[serde(default = "default_true")]
    pub connect_on_start: bool,
    /// Buffered events per subscriber
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_event_capacity() -> usize {
    256
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            connect_on_start: true,
            event_capacity: default_event_capacity(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Observable outcome of a poll tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PollEvent {
    CycleCompleted {
        cycle: u64,
        points: usize,
        elapsed_ms: u64,
    },
    /// The connector was busy when the tick fired
    CycleSkipped { cycle: u64 },
    ReadFailed { cycle: u64, error: ErrorInfo },
    StorageFailed {
        cycle: u64,
        error: ErrorInfo,
        retryable: bool,
    },
    /// Emitted once, on the first cycle that sees disconnected devices
    ConnectionWarning { failed_devices: Vec<String> },
}

/// Counters accumulated over the driver's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    pub cycles: u64,
    pub skipped: u64,
    pub read_failures: u64,
    pub storage_failures: u64,
    pub points_stored: u64,
}

/// Timer-driven reader
pub struct PollingDriver {
    connector: Arc<Mutex<Connector>>,
    sink: Arc<dyn TelemetrySink>,
    blocks: Arc<[ReadBlock]>,
    config: PollingConfig,
    events: broadcast::Sender<PollEvent>,
}

impl PollingDriver {
    pub fn new(
        connector: Connector,
        sink: Arc<dyn TelemetrySink>,
        blocks: Vec<ReadBlock>,
        config: PollingConfig,
    ) -> Self {
        Self::with_shared(Arc::new(Mutex::new(connector)), sink, blocks, config)
    }

    /// Drive a connector that other tasks also hold (status display, manual reads)
    pub fn with_shared(
        connector: Arc<Mutex<Connector>>,
        sink: Arc<dyn TelemetrySink>,
        blocks: Vec<ReadBlock>,
        config: PollingConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            connector,
            sink,
            blocks: blocks.into(),
            config,
            events,
        }
    }

    pub fn connector(&self) -> Arc<Mutex<Connector>> {
        Arc::clone(&self.connector)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events.subscribe()
    }

    /// Start the loop on the current runtime
    pub fn spawn(self) -> PollingHandle {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let events = self.events.clone();
        let connector = Arc::clone(&self.connector);

        let handle = tokio::spawn(async move { self.run(task_token).await });

        PollingHandle {
            handle,
            token,
            events,
            connector,
        }
    }

    async fn run(self, token: CancellationToken) -> PollStats {
        let mut stats = PollStats::default();
        let mut warned = false;

        if self.config.connect_on_start {
            tokio::select! {
                () = token.cancelled() => {},
                () = async { self.connector.lock().await.connect().await } => {},
            }
        }

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            "Polling {} blocks every {}ms",
            self.blocks.len(),
            self.config.interval_ms
        );

        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    tick += 1;
                    let Ok(guard) = Arc::clone(&self.connector).try_lock_owned() else {
                        stats.skipped += 1;
                        debug!("Cycle {} skipped: connector busy", tick);
                        self.emit(PollEvent::CycleSkipped { cycle: tick });
                        continue;
                    };

                    let cycle = AssertUnwindSafe(self.cycle(tick, guard, &mut stats, &mut warned))
                        .catch_unwind()
                        .await;
                    if let Err(panic) = cycle {
                        let err = LinkError::internal(panic_message(panic.as_ref()));
                        log_failure(tick, "panicked", &err);
                        stats.read_failures += 1;
                        self.emit(PollEvent::ReadFailed {
                            cycle: tick,
                            error: ErrorInfo::from_error(&err),
                        });
                    }
                }
            }
        }

        self.connector.lock().await.disconnect().await;
        info!(
            "Polling stopped after {} cycles ({} skipped)",
            stats.cycles, stats.skipped
        );
        stats
    }

    async fn cycle(
        &self,
        tick: u64,
        mut connector: tokio::sync::OwnedMutexGuard<Connector>,
        stats: &mut PollStats,
        warned: &mut bool,
    ) {
        let started = Instant::now();
        let result = connector.read_data(&self.blocks).await;

        if !*warned {
            let failed = connector.disconnected_devices();
            if !failed.is_empty() {
                warn!(
                    "{} device(s) not connected: {}",
                    failed.len(),
                    failed.join(", ")
                );
                self.emit(PollEvent::ConnectionWarning {
                    failed_devices: failed,
                });
                *warned = true;
            }
        }
        drop(connector);

        stats.cycles += 1;
        let batch = TelemetryBatch::from_result(&result, &self.blocks);
        match self.sink.store(&batch).await {
            Ok(()) => {
                stats.points_stored += batch.len() as u64;
                debug!("Cycle {} stored {} points", tick, batch.len());
                self.emit(PollEvent::CycleCompleted {
                    cycle: tick,
                    points: batch.len(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            },
            Err(e) => {
                stats.storage_failures += 1;
                let retryable = e.is_retryable();
                log_failure(tick, "storage failed", &e);
                self.emit(PollEvent::StorageFailed {
                    cycle: tick,
                    error: ErrorInfo::from_error(&e),
                    retryable,
                });
            },
        }
    }

    fn emit(&self, event: PollEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

/// Log a cycle failure at the level its error category calls for
fn log_failure(tick: u64, what: &str, err: &LinkError) {
    let level = err.log_level();
    if level == Level::ERROR {
        error!("Cycle {} {}: {}", tick, what, err);
    } else if level == Level::WARN {
        warn!("Cycle {} {}: {}", tick, what, err);
    } else {
        info!("Cycle {} {}: {}", tick, what, err);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Handle to a running driver
pub struct PollingHandle {
    handle: JoinHandle<PollStats>,
    token: CancellationToken,
    events: broadcast::Sender<PollEvent>,
    connector: Arc<Mutex<Connector>>,
}

impl PollingHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PollEvent> {
        self.events.subscribe()
    }

    pub fn connector(&self) -> Arc<Mutex<Connector>> {
        Arc::clone(&self.connector)
    }

    /// Cancel the loop, wait for it to disconnect, and return its counters
    pub async fn stop(self) -> PollStats {
        self.token.cancel();
        match self.handle.await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Polling task failed: {}", e);
                // The loop died without its teardown; disconnect here instead
                self.connector.lock().await.disconnect().await;
                PollStats::default()
            },
        }
    }
}
