use async_trait::async_trait;
use conductor_core::{ConductorError, ConductorResult};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A background component driven by the runtime.
#[async_trait]
pub trait Tickable: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Do one round of work. Errors are logged and the component is re-armed.
    async fn tick(&self) -> ConductorResult<()>;
}

struct Worker {
    tickable: Arc<dyn Tickable>,
    interval: Duration,
}

/// Single event loop that runs every registered [`Tickable`] on its own period.
///
/// Due times live in a min-heap. A worker whose previous tick is still running
/// when it comes due again is skipped for that round, so no worker ever runs
/// concurrently with itself.
#[derive(Default)]
pub struct Runtime {
    workers: Vec<Worker>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. Its first tick runs as soon as the loop starts.
    pub fn register(&mut self, tickable: Arc<dyn Tickable>, interval: Duration) -> &mut Self {
        self.workers.push(Worker { tickable, interval });
        self
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spawn the loop.
    pub fn start(self) -> RuntimeHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_loop(self.workers, shutdown_rx));
        RuntimeHandle { shutdown_tx, join }
    }
}

/// Handle to a running [`Runtime`].
pub struct RuntimeHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RuntimeHandle {
    /// Stop scheduling new ticks, wait for in-flight ones and for the loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "Runtime loop ended abnormally");
        }
    }
}

async fn run_loop(workers: Vec<Worker>, mut shutdown_rx: watch::Receiver<bool>) {
    let started = Instant::now();
    let mut due: BinaryHeap<Reverse<(Instant, usize)>> =
        (0..workers.len()).map(|idx| Reverse((started, idx))).collect();
    let mut running = vec![false; workers.len()];
    let mut in_flight: JoinSet<(usize, ConductorResult<()>)> = JoinSet::new();

    info!(workers = workers.len(), "Runtime started");
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let next = due.peek().map(|Reverse((at, _))| *at);

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                match joined {
                    Ok((idx, result)) => {
                        running[idx] = false;
                        if let Err(e) = result {
                            warn!(worker = workers[idx].tickable.name(), error = %e, "Tick failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "Tick task was lost"),
                }
            }
            _ = sleep_until(next) => {
                let Some(Reverse((_, idx))) = due.pop() else { continue };
                let worker = &workers[idx];
                if running[idx] {
                    debug!(worker = worker.tickable.name(), "Previous tick still running, skipping");
                } else {
                    running[idx] = true;
                    let tickable = Arc::clone(&worker.tickable);
                    in_flight.spawn(async move {
                        // Run in its own task so a panic surfaces as an error for this worker.
                        let result = match tokio::spawn(async move { tickable.tick().await }).await {
                            Ok(result) => result,
                            Err(e) => Err(ConductorError::Orchestrator(format!("tick panicked: {e}"))),
                        };
                        (idx, result)
                    });
                }
                due.push(Reverse((Instant::now() + worker.interval, idx)));
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Ok((idx, Err(e))) = joined {
            warn!(worker = workers[idx].tickable.name(), error = %e, "Tick failed during shutdown");
        }
    }
    info!("Runtime stopped");
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
