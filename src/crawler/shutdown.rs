//! Interruption monitor
//!
//! Turns SIGINT/SIGTERM and cloud pre-emption notices into a single shutdown
//! flag. The coordinator stops dispatching once the flag is set, drains
//! in-flight work for a bounded time, and exits with the run resumable.

use reqwest::Client;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Per-request timeout when polling the notice endpoint
const NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why the harvest was interrupted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptReason {
    /// SIGINT or SIGTERM
    Signal(&'static str),

    /// The instance is scheduled for termination
    PreemptionNotice,

    Manual(String),
}

impl fmt::Display for InterruptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(name) => write!(f, "received {}", name),
            Self::PreemptionNotice => write!(f, "instance termination notice"),
            Self::Manual(reason) => write!(f, "{}", reason),
        }
    }
}

struct Inner {
    triggered: AtomicBool,
    cleaned_up: AtomicBool,
    reason: Mutex<Option<InterruptReason>>,
    tx: watch::Sender<bool>,
}

/// Cloneable handle to the process-wide shutdown flag
#[derive(Clone)]
pub struct InterruptionMonitor {
    inner: Arc<Inner>,
}

impl Default for InterruptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptionMonitor {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                cleaned_up: AtomicBool::new(false),
                reason: Mutex::new(None),
                tx,
            }),
        }
    }

    /// Sets the shutdown flag
    ///
    /// # Returns
    ///
    /// `true` for the first call; later calls are no-ops
    pub fn trigger(&self, reason: InterruptReason) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return false;
        }

        tracing::warn!("Interruption: {}; stopping new work", reason);
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(reason);
        self.inner.tx.send_replace(true);
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// The reason passed to the first [`trigger`](Self::trigger)
    pub fn reason(&self) -> Option<InterruptReason> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Receiver that flips to `true` once triggered
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }

    /// Resolves once the flag is set
    pub async fn triggered(&self) {
        let mut rx = self.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Runs `cleanup` unless a cleanup already ran
    ///
    /// # Returns
    ///
    /// `true` if this call ran the cleanup
    pub async fn cleanup_once<F>(&self, cleanup: F) -> bool
    where
        F: Future<Output = ()>,
    {
        if self.inner.cleaned_up.swap(true, Ordering::SeqCst) {
            return false;
        }
        cleanup.await;
        true
    }

    /// Listens for SIGINT/SIGTERM in the background
    ///
    /// A second SIGINT after the first exits the process immediately.
    pub fn spawn_signal_listener(&self) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let name = wait_for_signal().await;
            monitor.trigger(InterruptReason::Signal(name));

            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::error!("Second interrupt received, exiting without draining");
                std::process::exit(130);
            }
        })
    }

    /// Polls a pre-emption notice endpoint in the background
    ///
    /// A 200 response means termination is scheduled; anything else,
    /// including connection errors, means it is not.
    ///
    /// # Arguments
    ///
    /// * `client` - HTTP client for polling
    /// * `url` - Notice endpoint
    /// * `interval` - Time between polls
    pub fn spawn_notice_poller(
        &self,
        client: Client,
        url: String,
        interval: Duration,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            tracing::info!("Polling {} every {:?} for termination notices", url, interval);
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = monitor.triggered() => return,
                }

                if poll_notice_once(&client, &url).await {
                    monitor.trigger(InterruptReason::PreemptionNotice);
                    return;
                }
            }
        })
    }
}

/// Checks the notice endpoint once
pub async fn poll_notice_once(client: &Client, url: &str) -> bool {
    match client.get(url).timeout(NOTICE_TIMEOUT).send().await {
        Ok(response) => response.status().as_u16() == 200,
        Err(e) => {
            tracing::trace!("Notice poll failed: {}", e);
            false
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}
