//! Background live-sync session: repeated passes with pause/stop control.
//!
//! A session is one spawned worker that runs engine passes against a single
//! auction, sleeping `poll_interval` between passes. Control travels over a
//! watch channel; the worker observes it between passes and at every page
//! boundary inside a pass, so pause and stop take effect without tearing a
//! page apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use lotsync_core::model::RunCounters;

use crate::engine::{RunControl, SyncEngine, SyncOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl LiveState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("live sync is already running")]
    AlreadyRunning,
    #[error("no live sync is running")]
    NotRunning,
}

#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub sync: SyncOptions,
    /// Sleep between passes.
    pub poll_interval: Duration,
}

/// Snapshot of the controller for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveStatus {
    pub state: LiveState,
    pub auction_code: Option<String>,
    /// Counters of the pass in flight (or the last pass, between polls).
    pub counters: RunCounters,
    pub runs_completed: u64,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

impl LiveStatus {
    fn idle() -> Self {
        Self {
            state: LiveState::Idle,
            auction_code: None,
            counters: RunCounters::default(),
            runs_completed: 0,
            last_fetch_at: None,
            last_finished_at: None,
        }
    }
}

#[derive(Default)]
struct SessionShared {
    runs_completed: AtomicU64,
    counters: std::sync::Mutex<RunCounters>,
    last_fetch_at: std::sync::Mutex<Option<DateTime<Utc>>>,
    last_finished_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl SessionShared {
    fn counters(&self) -> RunCounters {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Session {
    auction_code: String,
    control: watch::Sender<ControlSignal>,
    shared: Arc<SessionShared>,
    handle: JoinHandle<()>,
}

impl Session {
    /// The reported state follows the last control signal; a worker that has
    /// exited on its own (or finished honoring a stop) reads as stopped.
    fn state(&self) -> LiveState {
        if self.handle.is_finished() {
            return LiveState::Stopped;
        }
        match *self.control.borrow() {
            ControlSignal::Run => LiveState::Running,
            ControlSignal::Pause => LiveState::Paused,
            ControlSignal::Stop => LiveState::Stopped,
        }
    }

    fn status(&self) -> LiveStatus {
        LiveStatus {
            state: self.state(),
            auction_code: Some(self.auction_code.clone()),
            counters: self.shared.counters(),
            runs_completed: self.shared.runs_completed.load(Ordering::SeqCst),
            last_fetch_at: *self
                .shared
                .last_fetch_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
            last_finished_at: *self
                .shared
                .last_finished_at
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// Page-boundary hook handed to the engine: parks while paused, withdraws on
/// stop, and mirrors progress into the shared status snapshot.
struct SessionControl {
    control_rx: watch::Receiver<ControlSignal>,
    shared: Arc<SessionShared>,
}

#[async_trait]
impl RunControl for SessionControl {
    async fn proceed(&self) -> bool {
        let mut rx = self.control_rx.clone();
        loop {
            let signal = *rx.borrow();
            match signal {
                ControlSignal::Run => return true,
                ControlSignal::Stop => return false,
                ControlSignal::Pause => {
                    if rx.changed().await.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    fn on_progress(&self, counters: &RunCounters, last_fetch_at: Option<DateTime<Utc>>) {
        *self
            .shared
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = *counters;
        *self
            .shared
            .last_fetch_at
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = last_fetch_at;
    }
}

pub struct LiveSyncController {
    engine: Arc<SyncEngine>,
    session: Mutex<Option<Session>>,
}

impl LiveSyncController {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            session: Mutex::new(None),
        }
    }

    /// Start a session, or resume the current one if it is paused. Starting
    /// over a running session is rejected; a stopped session is replaced.
    pub async fn start(&self, options: LiveOptions) -> Result<LiveStatus, ControlError> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            match session.state() {
                LiveState::Running => return Err(ControlError::AlreadyRunning),
                LiveState::Paused => {
                    let _ = session.control.send(ControlSignal::Run);
                    info!(auction_code = %session.auction_code, "live sync resumed");
                    return Ok(session.status());
                }
                LiveState::Idle | LiveState::Stopped => {
                    // Finished worker; fall through and replace it.
                }
            }
        }

        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);
        let shared = Arc::new(SessionShared::default());
        let auction_code = options.sync.auction_code.clone();

        let handle = tokio::spawn(session_worker(
            self.engine.clone(),
            options,
            control_rx,
            shared.clone(),
        ));

        let session = Session {
            auction_code: auction_code.clone(),
            control: control_tx,
            shared,
            handle,
        };
        let status = session.status();
        *guard = Some(session);
        info!(%auction_code, "live sync started");
        Ok(status)
    }

    /// Pause the running session between pages.
    pub async fn pause(&self) -> Result<LiveStatus, ControlError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ControlError::NotRunning)?;
        if session.state() != LiveState::Running {
            return Err(ControlError::NotRunning);
        }
        let _ = session.control.send(ControlSignal::Pause);
        info!(auction_code = %session.auction_code, "live sync paused");
        Ok(session.status())
    }

    /// Stop the session for good. A stopped session cannot be resumed, only
    /// replaced by a fresh `start`.
    pub async fn stop(&self) -> Result<LiveStatus, ControlError> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(ControlError::NotRunning)?;
        if matches!(session.state(), LiveState::Stopped) {
            return Err(ControlError::NotRunning);
        }
        let _ = session.control.send(ControlSignal::Stop);
        info!(auction_code = %session.auction_code, "live sync stopped");
        Ok(session.status())
    }

    pub async fn status(&self) -> LiveStatus {
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) => session.status(),
            None => LiveStatus::idle(),
        }
    }
}

async fn session_worker(
    engine: Arc<SyncEngine>,
    options: LiveOptions,
    mut control_rx: watch::Receiver<ControlSignal>,
    shared: Arc<SessionShared>,
) {
    let control = SessionControl {
        control_rx: control_rx.clone(),
        shared: shared.clone(),
    };

    loop {
        // Park here while paused, before a pass opens a run record.
        if !control.proceed().await {
            break;
        }

        *shared.counters.lock().unwrap_or_else(|e| e.into_inner()) = RunCounters::default();
        match engine.run_controlled(&options.sync, &control).await {
            Ok(summary) => {
                shared.runs_completed.fetch_add(1, Ordering::SeqCst);
                *shared
                    .last_finished_at
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(summary.finished_at);
            }
            Err(err) => {
                // A storage failure will not heal by polling again.
                warn!(error = %err, "live pass failed, ending session");
                break;
            }
        }

        if *control_rx.borrow() == ControlSignal::Stop {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(options.poll_interval) => {}
            changed = control_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *control_rx.borrow() == ControlSignal::Stop {
            break;
        }
    }
}
