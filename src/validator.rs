//! Background token validation watchdog.
//!
//! Independently of UI activity, the validator periodically re-checks that
//! the session token still verifies and the session is still alive. Any
//! failure outside the post-login grace period broadcasts a forced logout
//! to every connected UI surface.

use std::sync::Arc;

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::channels::{ChannelRegistry, UiChannel, UiEvent};
use crate::session::SessionManager;
use crate::settings::ValidatorSettings;
use crate::signing::CredentialStore;

/// Result of a single validation pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// All checks passed.
    Valid,
    /// Skipped: the previous validation was too recent.
    RateLimited,
    /// A check failed inside the post-login grace period; no logout sent.
    GraceSkipped { reason: String },
    /// A check failed and a forced logout was broadcast.
    LoggedOut { reason: String },
}

/// Periodic session/token watchdog.
pub struct TokenValidator {
    settings: ValidatorSettings,
    session: Arc<SessionManager>,
    channels: Arc<ChannelRegistry>,
    credentials: Option<Arc<dyn CredentialStore>>,
    last_validation: Mutex<Option<Instant>>,
    login_time: Mutex<Option<Instant>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenValidator {
    pub fn new(
        settings: ValidatorSettings,
        session: Arc<SessionManager>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        Self {
            settings,
            session,
            channels,
            credentials: None,
            last_validation: Mutex::new(None),
            login_time: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Also fail validation while the credential store reports locked.
    pub fn with_credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Record a successful login, opening the grace period.
    pub async fn mark_login(&self) {
        *self.login_time.lock().await = Some(Instant::now());
        tracing::info!(
            grace_secs = self.settings.grace_period_secs,
            "Login recorded, validation grace period opened"
        );
    }

    /// Start the periodic validation loop. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            tracing::debug!("Token validator already running");
            return;
        }

        tracing::info!(
            interval_secs = self.settings.interval_secs,
            "Starting token validation watchdog"
        );
        let validator = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(validator.settings.interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                validator.validate_once().await;
            }
        }));
    }

    /// Stop the validation loop.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            tracing::info!("Token validation watchdog stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Register a UI channel and immediately ask it to report token state.
    pub async fn register_channel(&self, channel: Arc<dyn UiChannel>) {
        let channel_id = channel.id().to_string();
        self.channels.register(channel).await;

        let request = UiEvent::JwtValidationRequest {
            timestamp: Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.channels.send_to(&channel_id, &request).await {
            tracing::warn!(channel_id, "Initial validation request failed: {e}");
        }
    }

    pub async fn connected_channels(&self) -> usize {
        self.channels.count().await
    }

    /// Run one validation pass.
    pub async fn validate_once(&self) -> ValidationOutcome {
        let now = Instant::now();
        {
            let mut last = self.last_validation.lock().await;
            if let Some(prev) = *last
                && now.duration_since(prev) < Duration::from_secs(self.settings.min_spacing_secs)
            {
                return ValidationOutcome::RateLimited;
            }
            *last = Some(now);
        }

        let in_grace = match *self.login_time.lock().await {
            Some(login) => {
                now.duration_since(login) < Duration::from_secs(self.settings.grace_period_secs)
            }
            None => false,
        };

        match self.run_checks().await {
            None => {
                tracing::debug!("Token validation passed");
                ValidationOutcome::Valid
            }
            Some(reason) if in_grace => {
                tracing::info!(reason, "Validation failed inside grace period, skipping logout");
                ValidationOutcome::GraceSkipped { reason }
            }
            Some(reason) => {
                tracing::warn!(reason, "Validation failed, forcing logout");
                self.force_logout_all(&reason).await;
                ValidationOutcome::LoggedOut { reason }
            }
        }
    }

    /// Ordered checks; the first failure wins.
    async fn run_checks(&self) -> Option<String> {
        let Some(token) = self.session.current_token().await else {
            return Some("No session token found".to_string());
        };

        if let Err(e) = self.session.verify_token(token.expose_secret()).await {
            return Some(format!("Token validation failed: {e}"));
        }

        if !self.session.is_active().await {
            return Some("No active session".to_string());
        }

        if let Some(store) = &self.credentials
            && store.is_locked().await
        {
            return Some("Credential store is locked".to_string());
        }

        None
    }

    /// Broadcast a forced logout to every connected surface.
    ///
    /// Best effort: per-channel failures are isolated by the registry and
    /// never abort delivery to the rest.
    pub async fn force_logout_all(&self, reason: &str) -> usize {
        let event = UiEvent::ForceLogout {
            reason: reason.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };
        let delivered = self.channels.broadcast(&event).await;
        tracing::warn!(reason, delivered, "Forced logout broadcast");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::test_support::RecordingChannel;
    use crate::signing::InMemoryCredentialStore;

    fn test_settings() -> ValidatorSettings {
        ValidatorSettings {
            interval_secs: 30,
            min_spacing_secs: 10,
            grace_period_secs: 30,
        }
    }

    fn fixture() -> (Arc<SessionManager>, Arc<ChannelRegistry>, TokenValidator) {
        let session = SessionManager::new(Default::default());
        let channels = ChannelRegistry::new();
        let validator = TokenValidator::new(test_settings(), session.clone(), channels.clone());
        (session, channels, validator)
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_validates() {
        let (session, _, validator) = fixture();
        session.start_session("0xabc").await.unwrap();

        assert_eq!(validator.validate_once().await, ValidationOutcome::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn validations_are_rate_limited() {
        let (session, _, validator) = fixture();
        session.start_session("0xabc").await.unwrap();

        assert_eq!(validator.validate_once().await, ValidationOutcome::Valid);
        assert_eq!(
            validator.validate_once().await,
            ValidationOutcome::RateLimited
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(validator.validate_once().await, ValidationOutcome::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_in_grace_period_skips_logout() {
        let (_, channels, validator) = fixture();
        let ui = RecordingChannel::new("popup");
        channels.register(ui.clone()).await;

        validator.mark_login().await;
        let outcome = validator.validate_once().await;
        assert!(matches!(outcome, ValidationOutcome::GraceSkipped { .. }));
        assert!(ui.events.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_outside_grace_forces_logout() {
        let (_, channels, validator) = fixture();
        let ui = RecordingChannel::new("popup");
        channels.register(ui.clone()).await;

        validator.mark_login().await;
        tokio::time::advance(Duration::from_secs(31)).await;

        let outcome = validator.validate_once().await;
        assert!(matches!(outcome, ValidationOutcome::LoggedOut { .. }));

        let events = ui.events.lock().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], UiEvent::ForceLogout { reason, .. }
            if reason.contains("No session token")));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_reaches_surviving_channels_when_one_fails() {
        let (_, channels, validator) = fixture();
        let good = RecordingChannel::new("good");
        channels.register(good.clone()).await;
        channels.register(RecordingChannel::failing("bad")).await;

        assert_eq!(validator.force_logout_all("test reason").await, 1);
        assert_eq!(good.events.lock().await.len(), 1);
        assert_eq!(validator.connected_channels().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn locked_credential_store_forces_logout() {
        let session = SessionManager::new(Default::default());
        let channels = ChannelRegistry::new();
        let store = Arc::new(InMemoryCredentialStore::new());
        let validator = TokenValidator::new(test_settings(), session.clone(), channels)
            .with_credential_store(store.clone());

        session.start_session("0xabc").await.unwrap();
        assert_eq!(validator.validate_once().await, ValidationOutcome::Valid);

        store.set_locked(true).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        let outcome = validator.validate_once().await;
        assert!(matches!(outcome, ValidationOutcome::LoggedOut { reason }
            if reason.contains("locked")));
    }

    #[tokio::test(start_paused = true)]
    async fn register_channel_requests_validation() {
        let (_, _, validator) = fixture();
        let ui = RecordingChannel::new("popup");
        validator.register_channel(ui.clone()).await;

        let events = ui.events.lock().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], UiEvent::JwtValidationRequest { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_loop_broadcasts_on_expiry() {
        let (session, channels, validator) = fixture();
        let validator = Arc::new(validator);
        let ui = RecordingChannel::new("popup");
        channels.register(ui.clone()).await;

        session.start_session("0xabc").await.unwrap();
        validator.mark_login().await;
        validator.start().await;
        assert!(validator.is_running().await);

        // Session default timeout is 1800s; run the loop well past it.
        tokio::time::advance(Duration::from_secs(1900)).await;
        tokio::task::yield_now().await;

        validator.stop().await;
        let events = ui.events.lock().await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, UiEvent::ForceLogout { .. }))
        );
    }
}
