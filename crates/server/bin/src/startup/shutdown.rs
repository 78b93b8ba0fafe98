//! Graceful shutdown coordination.
//!
//! SIGINT and SIGTERM (or a programmatic trigger) move the coordinator to
//! `ShuttingDown`; the main task waits for that transition and then stops the
//! server within the configured timeout.

use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Maximum time to wait for the server to stop
    pub timeout: Duration,
    pub enable_signals: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            enable_signals: true,
        }
    }
}

#[derive(Clone)]
pub struct GracefulShutdown {
    state_tx: watch::Sender<ShutdownState>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (state_tx, _) = watch::channel(ShutdownState::Running);
        Self { state_tx, config }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Trigger shutdown; only the first trigger is kept
    pub fn shutdown(&self, reason: ShutdownReason) {
        let triggered = self.state_tx.send_if_modified(|state| {
            if *state == ShutdownState::Running {
                *state = ShutdownState::ShuttingDown(ShutdownSignal {
                    reason: reason.clone(),
                    timestamp: chrono::Utc::now(),
                });
                true
            } else {
                false
            }
        });
        if triggered {
            info!(%reason, "Triggering shutdown");
        }
    }

    /// Resolves with the first shutdown signal, immediately if already triggered
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        let mut rx = self.state_tx.subscribe();
        let result = rx
            .wait_for(|state| !matches!(state, ShutdownState::Running))
            .await
            .map(|state| state.clone());
        match result {
            Ok(ShutdownState::ShuttingDown(signal)) => signal,
            _ => ShutdownSignal {
                reason: ShutdownReason::Unknown,
                timestamp: chrono::Utc::now(),
            },
        }
    }

    pub fn complete(&self) {
        self.state_tx.send_replace(ShutdownState::Completed);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShutdownSignal {
    pub reason: ShutdownReason,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.reason, self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownReason {
    SigTerm,
    SigInt,
    Programmatic(String),
    Unknown,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::SigTerm => write!(f, "SIGTERM"),
            ShutdownReason::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            ShutdownReason::Programmatic(reason) => write!(f, "Programmatic: {}", reason),
            ShutdownReason::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownState {
    Running,
    ShuttingDown(ShutdownSignal),
    Completed,
}

/// Start signal handler that triggers graceful shutdown
pub fn start_signal_handler(coordinator: &GracefulShutdown) {
    if !coordinator.config.enable_signals {
        return;
    }

    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => ShutdownReason::SigInt,
                Err(e) => {
                    error!(error = %e, "Failed to register ctrl-c handler");
                    std::future::pending().await
                }
            }
        };

        #[cfg(unix)]
        let term = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                    ShutdownReason::SigTerm
                }
                Err(e) => {
                    error!(error = %e, "Failed to register SIGTERM handler");
                    std::future::pending().await
                }
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<ShutdownReason>();

        let reason = tokio::select! {
            reason = ctrl_c => reason,
            reason = term => reason,
        };
        coordinator.shutdown(reason);
    });
}
