//! Idle detection and lockdown.
//!
//! A periodic check drives one state machine (`Active -> Idle -> Lockdown`)
//! over a pluggable inactivity probe. Crossing the idle threshold either
//! locks down immediately (`lock_delay == 0`) or arms a delayed lockdown
//! that fresh activity cancels. Lockdown always ends the session before the
//! host hook runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::session::SessionManager;
use crate::settings::IdleSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleState {
    Active,
    Idle,
    Lockdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdleEvent {
    BecameIdle,
    /// Lockdown armed; surfaces can show a countdown.
    LockdownPending { delay: Duration },
    ActivityResumed,
    LockdownStarted,
}

/// Inactivity measurement seam.
///
/// Implementations report how long the user has been inactive; the detector
/// owns all thresholds and transitions.
#[async_trait]
pub trait IdleProbe: Send + Sync {
    async fn idle_for(&self) -> Duration;
}

/// Probe fed by explicit activity reports (`touch`).
#[derive(Clone)]
pub struct ActivityProbe {
    last_activity: Arc<Mutex<Instant>>,
}

impl ActivityProbe {
    pub fn new() -> Self {
        Self {
            last_activity: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record user activity. Cheap enough for per-event call sites.
    pub async fn touch(&self) {
        *self.last_activity.lock().await = Instant::now();
    }
}

impl Default for ActivityProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdleProbe for ActivityProbe {
    async fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(*self.last_activity.lock().await)
    }
}

/// Host hook invoked after lockdown has ended the session.
#[async_trait]
pub trait LockdownHandler: Send + Sync {
    async fn on_lockdown(&self);
}

/// Drives idle state from a probe and executes lockdown.
pub struct IdleDetector {
    settings: IdleSettings,
    probe: Arc<dyn IdleProbe>,
    session: Arc<SessionManager>,
    handler: Arc<dyn LockdownHandler>,
    state: RwLock<IdleState>,
    /// Idle handling only applies to a verified login.
    login_verified: AtomicBool,
    pending_lockdown: Mutex<Option<JoinHandle<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<IdleEvent>,
}

impl IdleDetector {
    pub fn new(
        settings: IdleSettings,
        probe: Arc<dyn IdleProbe>,
        session: Arc<SessionManager>,
        handler: Arc<dyn LockdownHandler>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            settings,
            probe,
            session,
            handler,
            state: RwLock::new(IdleState::Active),
            login_verified: AtomicBool::new(false),
            pending_lockdown: Mutex::new(None),
            task: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IdleEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> IdleState {
        *self.state.read().await
    }

    /// Gate idle handling on login state. Verifying a login also resets the
    /// machine to `Active` and disarms any pending lockdown.
    pub async fn set_login_verified(&self, verified: bool) {
        self.login_verified.store(verified, Ordering::SeqCst);
        if verified {
            self.disarm_pending().await;
            *self.state.write().await = IdleState::Active;
        }
    }

    /// Start the periodic probe loop. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        tracing::info!(
            threshold_secs = self.settings.threshold_secs,
            lock_delay_secs = self.settings.lock_delay_secs,
            "Starting idle detection"
        );
        let detector = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                detector.settings.check_interval_secs,
            ));
            loop {
                ticker.tick().await;
                detector.check().await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.disarm_pending().await;
    }

    /// Evaluate the probe against the threshold once.
    pub async fn check(self: &Arc<Self>) {
        if !self.login_verified.load(Ordering::SeqCst) {
            return;
        }

        let idle_for = self.probe.idle_for().await;
        let threshold = Duration::from_secs(self.settings.threshold_secs);
        let current = *self.state.read().await;

        match current {
            IdleState::Active if idle_for >= threshold => self.enter_idle().await,
            IdleState::Idle if idle_for < threshold => self.resume_active().await,
            _ => {}
        }
    }

    async fn enter_idle(self: &Arc<Self>) {
        *self.state.write().await = IdleState::Idle;
        let _ = self.events.send(IdleEvent::BecameIdle);

        let delay = Duration::from_secs(self.settings.lock_delay_secs);
        if delay.is_zero() {
            tracing::warn!("Idle threshold crossed, locking down immediately");
            self.lockdown().await;
            return;
        }

        tracing::info!(?delay, "Idle threshold crossed, lockdown pending");
        let _ = self.events.send(IdleEvent::LockdownPending { delay });

        let detector = Arc::clone(self);
        let threshold = Duration::from_secs(self.settings.threshold_secs);
        let mut pending = self.pending_lockdown.lock().await;
        if let Some(old) = pending.take() {
            old.abort();
        }
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Re-probe at the deadline: activity during the delay cancels.
            if detector.probe.idle_for().await < threshold {
                detector.resume_active().await;
                return;
            }
            if *detector.state.read().await == IdleState::Idle {
                detector.lockdown().await;
            }
        }));
    }

    async fn resume_active(&self) {
        {
            let mut state = self.state.write().await;
            if *state != IdleState::Idle {
                return;
            }
            *state = IdleState::Active;
        }
        tracing::debug!("Activity resumed, lockdown cancelled");
        let _ = self.events.send(IdleEvent::ActivityResumed);
        // No awaits after this abort: the pending task may be aborting itself.
        self.disarm_pending().await;
    }

    async fn disarm_pending(&self) {
        if let Some(pending) = self.pending_lockdown.lock().await.take() {
            pending.abort();
        }
    }

    /// Session first, host hook second: the hook can never observe a live
    /// session.
    async fn lockdown(&self) {
        {
            let mut state = self.state.write().await;
            if *state == IdleState::Lockdown {
                return;
            }
            *state = IdleState::Lockdown;
        }
        tracing::warn!("Idle lockdown, ending session");
        self.session.end_session().await;
        self.handler.on_lockdown().await;
        let _ = self.events.send(IdleEvent::LockdownStarted);
    }
}
