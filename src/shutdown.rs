//! Graceful shutdown: wait for SIGINT/SIGTERM, let axum drain connections,
//! then run the registered handlers under a total timeout.
//!
//! The only durable state outside SQLite is the workbook, so the important
//! handler is [`WorkbookShutdownHandler`], which retries a persist when the
//! last write left the store dirty.

use crate::state::AppState;
use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Upper bound for flushing a single component
    pub flush_timeout: Duration,
    /// Upper bound for the whole handler sequence
    pub total_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(10),
        }
    }
}

impl ShutdownConfig {
    pub fn with_total_timeout(mut self, timeout_secs: u64) -> Self {
        self.total_timeout = Duration::from_secs(timeout_secs);
        self.flush_timeout = self.flush_timeout.min(self.total_timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Flushing,
    Complete,
    /// Handlers did not finish within the total timeout
    Forced,
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShutdownPhase::Running => "running",
            ShutdownPhase::Draining => "draining",
            ShutdownPhase::Flushing => "flushing",
            ShutdownPhase::Complete => "complete",
            ShutdownPhase::Forced => "forced",
        };
        f.write_str(name)
    }
}

pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    phase: RwLock<ShutdownPhase>,
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config,
            phase: RwLock::new(ShutdownPhase::Running),
            token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn phase(&self) -> ShutdownPhase {
        *self.phase.read().await
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves on SIGINT/SIGTERM or when the token is cancelled elsewhere.
    pub async fn wait_for_signal(&self) {
        tokio::select! {
            signal = wait_for_os_signal() => {
                info!(signal, "received shutdown signal, draining connections");
            }
            _ = self.token.cancelled() => {
                info!("shutdown requested");
            }
        }
        self.token.cancel();
        *self.phase.write().await = ShutdownPhase::Draining;
    }

    /// Run `handler` under the total timeout.
    pub async fn shutdown(&self, handler: &dyn ShutdownHandler) -> Result<()> {
        *self.phase.write().await = ShutdownPhase::Flushing;
        self.token.cancel();
        info!("running shutdown handlers");

        match timeout(self.config.total_timeout, handler.shutdown()).await {
            Ok(result) => {
                *self.phase.write().await = ShutdownPhase::Complete;
                info!("graceful shutdown completed");
                result
            }
            Err(_) => {
                *self.phase.write().await = ShutdownPhase::Forced;
                error!(
                    timeout_secs = self.config.total_timeout.as_secs(),
                    "shutdown handlers exceeded total timeout"
                );
                Err(anyhow::anyhow!("shutdown timeout exceeded"))
            }
        }
    }
}

async fn wait_for_os_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT",
        _ = terminate => "SIGTERM",
    }
}

#[async_trait::async_trait]
pub trait ShutdownHandler: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

/// Persists the workbook if memory is ahead of disk.
pub struct WorkbookShutdownHandler {
    state: Arc<AppState>,
    flush_timeout: Duration,
}

impl WorkbookShutdownHandler {
    pub fn new(state: Arc<AppState>, flush_timeout: Duration) -> Self {
        Self {
            state,
            flush_timeout,
        }
    }
}

#[async_trait::async_trait]
impl ShutdownHandler for WorkbookShutdownHandler {
    async fn shutdown(&self) -> Result<()> {
        let store = self.state.store();
        if !store.is_dirty() {
            debug!("workbook clean at shutdown");
            return Ok(());
        }
        warn!(
            path = %store.path().display(),
            version = store.version(),
            "workbook has unsaved changes, flushing"
        );
        let flush = task::spawn_blocking(move || store.flush());
        timeout(self.flush_timeout, flush)
            .await
            .context("workbook flush timed out")?
            .context("workbook flush task panicked")?
            .context("workbook flush failed")?;
        info!("workbook flushed");
        Ok(())
    }
}

/// Runs handlers in order; one failing does not stop the rest.
#[derive(Default)]
pub struct CompositeShutdownHandler {
    handlers: Vec<Box<dyn ShutdownHandler>>,
}

impl CompositeShutdownHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&mut self, handler: Box<dyn ShutdownHandler>) {
        self.handlers.push(handler);
    }
}

#[async_trait::async_trait]
impl ShutdownHandler for CompositeShutdownHandler {
    async fn shutdown(&self) -> Result<()> {
        let mut failures = 0usize;
        for (idx, handler) in self.handlers.iter().enumerate() {
            if let Err(e) = handler.shutdown().await {
                failures += 1;
                error!(handler_index = idx, "shutdown handler error: {:#}", e);
            }
        }
        if failures > 0 {
            anyhow::bail!("{failures} shutdown handler(s) failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>, bool);

    #[async_trait::async_trait]
    impl ShutdownHandler for Counting {
        async fn shutdown(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            if self.1 {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl ShutdownHandler for Stuck {
        async fn shutdown(&self) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[test]
    fn total_timeout_caps_flush_timeout() {
        let config = ShutdownConfig::default().with_total_timeout(2);
        assert_eq!(config.total_timeout, Duration::from_secs(2));
        assert_eq!(config.flush_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn composite_runs_every_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut composite = CompositeShutdownHandler::new();
        composite.add_handler(Box::new(Counting(calls.clone(), true)));
        composite.add_handler(Box::new(Counting(calls.clone(), false)));

        let coordinator = ShutdownCoordinator::new(ShutdownConfig::default());
        assert!(coordinator.shutdown(&composite).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.phase().await, ShutdownPhase::Complete);
    }

    #[tokio::test]
    async fn stuck_handler_is_forced() {
        let coordinator = ShutdownCoordinator::new(ShutdownConfig::default().with_total_timeout(1));
        assert!(coordinator.shutdown(&Stuck).await.is_err());
        assert_eq!(coordinator.phase().await, ShutdownPhase::Forced);
        assert!(coordinator.is_shutdown_initiated());
    }

    #[tokio::test]
    async fn cancelled_token_ends_signal_wait() {
        let coordinator = ShutdownCoordinator::new(ShutdownConfig::default());
        coordinator.token().cancel();
        coordinator.wait_for_signal().await;
        assert_eq!(coordinator.phase().await, ShutdownPhase::Draining);
    }
}
