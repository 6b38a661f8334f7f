//! Query cancellation and timeouts.
//!
//! A [`QueryContext`] travels with a [`QuerySet`](crate::query::QuerySet) and
//! governs every statement its terminal operations run. Cancellation is
//! signalled through a [`CancelHandle`]; a timeout bounds each statement.
//! Either way the pending statement future is dropped and the caller
//! receives a typed error. Dropping is what aborts the work: backends tie a
//! running statement to the call that issued it and stop only that one.

use std::future::Future;
use std::time::Duration;

use quarry_core::settings::QuerySettings;
use quarry_core::{QuarryError, QuarryResult};
use tokio::sync::watch;

/// Cancels every query bound to the paired [`QueryContext`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: std::sync::Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Signals cancellation. Queries already running are abandoned.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Execution settings for one query chain.
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    cancel: Option<watch::Receiver<bool>>,
    timeout: Option<Duration>,
    log_sql: bool,
}

impl QueryContext {
    /// A context without cancellation or timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that can be cancelled through the returned handle.
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            cancel: Some(rx),
            ..Self::default()
        };
        (ctx, CancelHandle { tx: std::sync::Arc::new(tx) })
    }

    /// A context built from the query settings.
    pub fn from_settings(settings: &QuerySettings) -> Self {
        Self {
            cancel: None,
            timeout: settings.timeout(),
            log_sql: settings.log_sql,
        }
    }

    /// Bounds every statement by `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The statement timeout, if any.
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether compiled SQL text is included in debug logs.
    pub const fn log_sql(&self) -> bool {
        self.log_sql
    }

    /// Returns `true` if the context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Runs `fut` under this context, dropping it on cancellation or
    /// timeout.
    pub async fn run<T, F>(&self, fut: F) -> QuarryResult<T>
    where
        F: Future<Output = QuarryResult<T>>,
    {
        if self.is_cancelled() {
            return Err(QuarryError::Cancelled("context cancelled before the query started".into()));
        }

        let guarded = async {
            tokio::select! {
                res = fut => res,
                () = wait_cancel(self.cancel.clone()) => {
                    tracing::warn!("query cancelled");
                    Err(QuarryError::Cancelled("context cancelled".into()))
                }
            }
        };

        match self.timeout {
            Some(limit) => {
                if let Ok(res) = tokio::time::timeout(limit, guarded).await {
                    res
                } else {
                    tracing::warn!(timeout_ms = limit.as_millis(), "query timed out");
                    Err(QuarryError::Timeout(limit))
                }
            }
            None => guarded.await,
        }
    }
}

/// Resolves once the channel reports cancellation. Never resolves for a
/// context without a channel or once every handle is dropped.
async fn wait_cancel(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
