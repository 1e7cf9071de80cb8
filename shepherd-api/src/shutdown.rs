//! Graceful shutdown handling
//!
//! A single coordinator turns SIGTERM/SIGINT into a watch signal that the
//! HTTP server and the background probe sweep both observe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Shutdown coordinator for graceful termination
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    is_shutting_down: Arc<AtomicBool>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// `timeout` bounds how long background tasks get to stop
    pub fn with_timeout(timeout: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate graceful shutdown; later calls are no-ops
    pub fn shutdown(&self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    /// Resolves once shutdown has been initiated
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Wait for SIGTERM or SIGINT, then initiate shutdown
    pub async fn wait_for_signal(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = sigint.recv() => info!("Received SIGINT"),
                        _ = self.wait() => return,
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    error!(error = %e, "Failed to register signal handlers, falling back to Ctrl+C");
                    self.wait_for_ctrl_c().await;
                }
            }
        }

        #[cfg(not(unix))]
        self.wait_for_ctrl_c().await;

        self.shutdown();
    }

    async fn wait_for_ctrl_c(&self) {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received Ctrl+C"),
                Err(e) => {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                    self.wait().await;
                }
            },
            _ = self.wait() => {}
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Background tasks that stop on their own once shutdown is signalled
#[derive(Default)]
pub struct TaskShutdown {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl TaskShutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.tasks.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait up to `timeout` for each task, aborting stragglers
    pub async fn join_all(&mut self, timeout: Duration) {
        info!("Stopping {} background tasks", self.tasks.len());

        for (name, mut handle) in self.tasks.drain(..) {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => info!(task = name, "Task stopped"),
                Ok(Err(e)) if e.is_cancelled() => info!(task = name, "Task cancelled"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Task failed"),
                Err(_) => {
                    warn!(task = name, "Task did not stop within timeout, aborting");
                    handle.abort();
                }
            }
        }
    }
}
