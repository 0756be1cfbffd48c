//! Session lifecycle management.
//!
//! One active session per privileged process. The session owns the current
//! bearer token, self-enforces its expiry, warns before it runs out, and
//! auto-extends on user activity inside the warning window. State is
//! persisted to `~/.walletcore/session.json` so a restart inside the
//! session window can resume without a fresh login.

pub mod token;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::AuthError;
use crate::settings::SessionSettings;

pub use token::{TokenClaims, TokenSigner, token_digest};

/// Lifecycle events published to in-process subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started { session_id: Uuid },
    Warning { session_id: Uuid, time_remaining: Duration },
    Extended { session_id: Uuid, expires_in: Duration },
    Expired { session_id: Uuid },
    Ended { session_id: Uuid },
}

/// Live session state. Internal; callers observe it through manager methods.
struct ActiveSession {
    session_id: Uuid,
    subject_id: String,
    issued_at: DateTime<Utc>,
    expires_at: Instant,
    expires_at_wall: DateTime<Utc>,
    last_activity_at: Instant,
    warning_shown: bool,
    token: SecretString,
    token_expires_at_wall: DateTime<Utc>,
    generation: u64,
}

/// Session snapshot persisted to disk.
///
/// The token is deliberately absent: signing keys do not survive a process
/// restart, so a restored session always mints a fresh one.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedSession {
    session_id: Uuid,
    subject_id: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

/// Get the default session file path (~/.walletcore/session.json).
pub fn default_session_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".walletcore")
        .join("session.json")
}

/// Manages the single active session and its bearer token.
pub struct SessionManager {
    settings: SessionSettings,
    signer: TokenSigner,
    state: RwLock<Option<ActiveSession>>,
    /// Digests of explicitly invalidated tokens.
    blacklist: RwLock<HashSet<String>>,
    events: broadcast::Sender<SessionEvent>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    /// Monotonic guard so superseded timers cannot act on a newer session.
    generation: AtomicU64,
    persist_path: Option<PathBuf>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Arc<Self> {
        Self::build(settings, None)
    }

    /// Create a manager that persists session state to `path`.
    pub fn with_persistence(settings: SessionSettings, path: PathBuf) -> Arc<Self> {
        Self::build(settings, Some(path))
    }

    fn build(settings: SessionSettings, persist_path: Option<PathBuf>) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            settings,
            signer: TokenSigner::new(),
            state: RwLock::new(None),
            blacklist: RwLock::new(HashSet::new()),
            events,
            timers: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            persist_path,
        })
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.settings.timeout_secs)
    }

    fn warning(&self) -> Duration {
        Duration::from_secs(self.settings.warning_secs)
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a session for `subject_id`, replacing any existing one.
    pub async fn start_session(self: &Arc<Self>, subject_id: &str) -> Result<Uuid, AuthError> {
        let subject_id = subject_id.trim();
        if subject_id.is_empty() {
            return Err(AuthError::SessionStartFailed {
                reason: "empty subject id".to_string(),
            });
        }

        // At most one active session.
        self.end_session().await;

        let session_id = Uuid::new_v4();
        let generation = self.next_generation();
        let token = self
            .signer
            .mint(subject_id, session_id, self.settings.token_ttl_secs)?;

        let now_wall = Utc::now();
        let session = ActiveSession {
            session_id,
            subject_id: subject_id.to_string(),
            issued_at: now_wall,
            expires_at: Instant::now() + self.timeout(),
            expires_at_wall: now_wall + chrono::Duration::seconds(self.settings.timeout_secs as i64),
            last_activity_at: Instant::now(),
            warning_shown: false,
            token: SecretString::from(token),
            token_expires_at_wall: now_wall
                + chrono::Duration::seconds(self.settings.token_ttl_secs as i64),
            generation,
        };
        *self.state.write().await = Some(session);

        self.persist().await;
        self.arm_timers(generation, self.timeout()).await;

        tracing::info!(%session_id, subject_id, "Session started");
        let _ = self.events.send(SessionEvent::Started { session_id });
        Ok(session_id)
    }

    /// Extend the session, by a full timeout window unless `additional_ttl`
    /// asks for a different one.
    ///
    /// Resets the warning latch and re-signs the token when its remaining
    /// lifetime has dropped below the refresh threshold.
    pub async fn extend_session(
        self: &Arc<Self>,
        additional_ttl: Option<Duration>,
    ) -> Result<(), AuthError> {
        if !self.is_active().await {
            return Err(AuthError::NoActiveSession);
        }

        let window = additional_ttl.unwrap_or_else(|| self.timeout());
        let generation = self.next_generation();
        let (session_id, expires_in) = {
            let mut guard = self.state.write().await;
            let session = guard.as_mut().ok_or(AuthError::NoActiveSession)?;

            let now_wall = Utc::now();
            session.expires_at = Instant::now() + window;
            session.expires_at_wall =
                now_wall + chrono::Duration::from_std(window).unwrap_or_default();
            session.last_activity_at = Instant::now();
            session.warning_shown = false;
            session.generation = generation;

            let token_remaining = session.token_expires_at_wall - now_wall;
            if token_remaining.num_seconds()
                < self.settings.token_refresh_threshold_secs as i64
            {
                let fresh = self.signer.mint(
                    &session.subject_id,
                    session.session_id,
                    self.settings.token_ttl_secs,
                )?;
                session.token = SecretString::from(fresh);
                session.token_expires_at_wall =
                    now_wall + chrono::Duration::seconds(self.settings.token_ttl_secs as i64);
                tracing::debug!(session_id = %session.session_id, "Session token refreshed");
            }

            (session.session_id, window)
        };

        self.persist().await;
        self.arm_timers(generation, window).await;

        tracing::debug!(%session_id, "Session extended");
        let _ = self.events.send(SessionEvent::Extended {
            session_id,
            expires_in,
        });
        Ok(())
    }

    /// End the session, blacklisting its token. Idempotent.
    pub async fn end_session(&self) {
        let removed = self.state.write().await.take();

        let mut timers = self.timers.lock().await;
        for timer in timers.drain(..) {
            timer.abort();
        }
        drop(timers);

        if let Some(session) = removed {
            self.blacklist_current(&session.token).await;
            self.clear_persisted().await;
            tracing::info!(session_id = %session.session_id, "Session ended");
            let _ = self.events.send(SessionEvent::Ended {
                session_id: session.session_id,
            });
        }
    }

    /// Whether a session is currently active.
    ///
    /// An expired session is reaped here as a side effect, so callers never
    /// observe `true` past the deadline even if the expiry timer has not
    /// fired yet.
    pub async fn is_active(&self) -> bool {
        let generation = {
            let guard = self.state.read().await;
            match guard.as_ref() {
                None => return false,
                Some(s) if Instant::now() >= s.expires_at => s.generation,
                Some(_) => return true,
            }
        };
        self.expire(generation).await;
        false
    }

    /// Record user activity, auto-extending inside the warning window.
    pub async fn update_activity(self: &Arc<Self>) {
        if !self.is_active().await {
            return;
        }

        let should_extend = {
            let mut guard = self.state.write().await;
            let Some(session) = guard.as_mut() else {
                return;
            };
            session.last_activity_at = Instant::now();
            let remaining = session.expires_at.saturating_duration_since(Instant::now());
            self.settings.auto_extend_on_activity && remaining <= self.warning()
        };

        if should_extend
            && let Err(e) = self.extend_session(None).await
        {
            tracing::warn!("Auto-extend on activity failed: {e}");
        }
    }

    /// Current bearer token, if a session is active.
    pub async fn current_token(&self) -> Option<SecretString> {
        let guard = self.state.read().await;
        guard
            .as_ref()
            .filter(|s| Instant::now() < s.expires_at)
            .map(|s| s.token.clone())
    }

    /// Verify a serialized token against the live session.
    ///
    /// Valid means: not revoked, signature verifies, not expired, and bound
    /// to the currently active session.
    pub async fn verify_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        if self.blacklist.read().await.contains(&token_digest(token)) {
            return Err(AuthError::InvalidToken {
                reason: "token revoked".to_string(),
            });
        }

        let claims = self.signer.verify(token)?;

        if !self.is_active().await {
            return Err(AuthError::NoActiveSession);
        }
        let guard = self.state.read().await;
        let session = guard.as_ref().ok_or(AuthError::NoActiveSession)?;
        if claims.sid != session.session_id {
            return Err(AuthError::InvalidToken {
                reason: "token bound to another session".to_string(),
            });
        }
        Ok(claims)
    }

    /// Id of the active session, if any.
    pub async fn session_id(&self) -> Option<Uuid> {
        self.state.read().await.as_ref().map(|s| s.session_id)
    }

    /// Time until expiry, if a session is active.
    pub async fn expires_in(&self) -> Option<Duration> {
        let guard = self.state.read().await;
        guard
            .as_ref()
            .map(|s| s.expires_at.saturating_duration_since(Instant::now()))
            .filter(|remaining| !remaining.is_zero())
    }

    /// Restore a persisted session if one exists and has not expired.
    ///
    /// A fresh token is minted for the restored session; if the restored
    /// session is already inside the warning window it is extended.
    pub async fn restore(self: &Arc<Self>) -> Result<bool, AuthError> {
        let Some(path) = &self.persist_path else {
            return Ok(false);
        };

        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                tracing::warn!("Failed to read session file {}: {e}", path.display());
                return Ok(false);
            }
        };
        let persisted: PersistedSession = match serde_json::from_str(&data) {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!("Discarding unparseable session file: {e}");
                self.clear_persisted().await;
                return Ok(false);
            }
        };

        let now_wall = Utc::now();
        let remaining_ms = (persisted.expires_at - now_wall).num_milliseconds();
        if remaining_ms <= 0 {
            tracing::info!(session_id = %persisted.session_id, "Persisted session expired, discarding");
            self.clear_persisted().await;
            return Ok(false);
        }
        let remaining = Duration::from_millis(remaining_ms as u64);

        let generation = self.next_generation();
        let token = self.signer.mint(
            &persisted.subject_id,
            persisted.session_id,
            self.settings.token_ttl_secs,
        )?;
        let session = ActiveSession {
            session_id: persisted.session_id,
            subject_id: persisted.subject_id,
            issued_at: persisted.issued_at,
            expires_at: Instant::now() + remaining,
            expires_at_wall: persisted.expires_at,
            last_activity_at: Instant::now(),
            warning_shown: false,
            token: SecretString::from(token),
            token_expires_at_wall: now_wall
                + chrono::Duration::seconds(self.settings.token_ttl_secs as i64),
            generation,
        };
        let session_id = session.session_id;
        *self.state.write().await = Some(session);
        self.arm_timers(generation, remaining).await;

        tracing::info!(%session_id, ?remaining, "Session restored from disk");
        let _ = self.events.send(SessionEvent::Started { session_id });

        if remaining <= self.warning() {
            self.extend_session(None).await?;
        }
        Ok(true)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Arm warning and expiry timers for a session window of `remaining`.
    async fn arm_timers(self: &Arc<Self>, generation: u64, remaining: Duration) {
        let mut timers = self.timers.lock().await;
        for timer in timers.drain(..) {
            timer.abort();
        }

        let warning_delay = remaining.saturating_sub(self.warning());
        let manager = Arc::clone(self);
        timers.push(tokio::spawn(async move {
            tokio::time::sleep(warning_delay).await;
            manager.fire_warning(generation).await;
        }));

        let manager = Arc::clone(self);
        timers.push(tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            manager.expire(generation).await;
        }));
    }

    async fn fire_warning(&self, generation: u64) {
        let (session_id, time_remaining) = {
            let mut guard = self.state.write().await;
            let Some(session) = guard.as_mut() else {
                return;
            };
            if session.generation != generation || session.warning_shown {
                return;
            }
            session.warning_shown = true;
            (
                session.session_id,
                session.expires_at.saturating_duration_since(Instant::now()),
            )
        };

        tracing::debug!(%session_id, ?time_remaining, "Session expiry warning");
        let _ = self.events.send(SessionEvent::Warning {
            session_id,
            time_remaining,
        });
    }

    /// Reap an expired session. Emits `Expired` at most once: the state is
    /// removed under the write lock, so racing callers find it gone.
    async fn expire(&self, generation: u64) {
        let removed = {
            let mut guard = self.state.write().await;
            match guard.as_ref() {
                Some(s) if s.generation == generation && Instant::now() >= s.expires_at => {
                    guard.take()
                }
                _ => None,
            }
        };

        if let Some(session) = removed {
            self.blacklist_current(&session.token).await;
            self.clear_persisted().await;
            tracing::info!(session_id = %session.session_id, "Session expired");
            let _ = self.events.send(SessionEvent::Expired {
                session_id: session.session_id,
            });
        }
    }

    async fn blacklist_current(&self, token: &SecretString) {
        self.blacklist
            .write()
            .await
            .insert(token_digest(token.expose_secret()));
    }

    /// Best-effort persistence; the in-memory session stays authoritative.
    async fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        let snapshot = {
            let guard = self.state.read().await;
            let Some(session) = guard.as_ref() else {
                return;
            };
            PersistedSession {
                session_id: session.session_id,
                subject_id: session.subject_id.clone(),
                issued_at: session.issued_at,
                expires_at: session.expires_at_wall,
            }
        };

        if let Err(e) = self.write_persisted(path, &snapshot).await {
            tracing::warn!("Failed to persist session: {e}");
        }
    }

    async fn write_persisted(
        &self,
        path: &PathBuf,
        snapshot: &PersistedSession,
    ) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(path, json).await?;

        // Restrictive permissions: the file names a live session.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(path, perms).await?;
        }
        Ok(())
    }

    async fn clear_persisted(&self) {
        if let Some(path) = &self.persist_path
            && let Err(e) = tokio::fs::remove_file(path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove session file: {e}");
        }
    }
}
