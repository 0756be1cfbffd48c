//! Security routing for UI surface requests.
//!
//! Every request to open or focus a wallet surface flows through here. The
//! routing decision itself is a pure function over a freshly gathered
//! `SecurityState`; the surrounding shell re-validates external requests
//! against the live session and degrades to least privilege whenever state
//! gathering fails.

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::session::SessionManager;
use crate::settings::SettingsStore;

/// Where a surface request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Raised by the runtime itself (session warning, lockdown reroute).
    Internal,
    /// Raised by a page or user gesture; must be re-validated.
    External,
}

/// Routing destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Register,
    Legal,
    Login,
    Home,
    /// A specific authenticated page.
    Page(String),
}

/// Security snapshot gathered fresh for each routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityState {
    pub wallet_locked: bool,
    pub token_valid: bool,
    pub session_active: bool,
    pub is_initialized: bool,
    pub terms_accepted: bool,
}

impl SecurityState {
    /// The least-privilege snapshot, used when state gathering fails.
    pub fn most_restrictive() -> Self {
        Self {
            wallet_locked: true,
            token_valid: false,
            session_active: false,
            is_initialized: false,
            terms_accepted: false,
        }
    }
}

/// Decide the routing target for a surface request.
///
/// Priority order is fixed: registration before legal terms before
/// authentication before the requested destination. A requested target is
/// only honored for a fully authenticated state.
pub fn decide(state: &SecurityState, requested: Option<&Target>) -> Target {
    if !state.is_initialized {
        Target::Register
    } else if !state.terms_accepted {
        Target::Legal
    } else if !state.token_valid {
        Target::Login
    } else {
        requested.cloned().unwrap_or(Target::Home)
    }
}

/// Window-system seam driven by the router.
#[async_trait]
pub trait WindowManager: Send + Sync {
    /// Open (or retarget) the wallet surface at `target`.
    async fn show(&self, target: &Target, pinned_location: &str) -> Result<(), ChannelError>;

    /// Focus the existing surface without changing what it displays.
    async fn focus(&self) -> Result<(), ChannelError>;

    /// Whether a wallet surface is currently open.
    async fn has_active_window(&self) -> bool;
}

/// Imperative shell around [`decide`].
pub struct SecurityRouter {
    session: Arc<SessionManager>,
    settings: Arc<dyn SettingsStore>,
    windows: Arc<dyn WindowManager>,
}

impl SecurityRouter {
    pub fn new(
        session: Arc<SessionManager>,
        settings: Arc<dyn SettingsStore>,
        windows: Arc<dyn WindowManager>,
    ) -> Self {
        Self {
            session,
            settings,
            windows,
        }
    }

    /// Handle a request to open or focus a wallet surface.
    pub async fn handle_popup_request(
        &self,
        requested: Option<Target>,
        pinned_location: &str,
        origin: Origin,
    ) -> Result<(), ChannelError> {
        tracing::info!(?requested, ?origin, "Handling surface request");

        if self.windows.has_active_window().await {
            self.handle_existing_surface(origin).await
        } else {
            let state = self.gather_state().await;
            let target = decide(&state, requested.as_ref());
            tracing::info!(?target, "Routing new surface");
            self.windows.show(&target, pinned_location).await
        }
    }

    /// An already-open surface: internal requests only focus; external
    /// requests re-validate the session before being allowed near it.
    async fn handle_existing_surface(&self, origin: Origin) -> Result<(), ChannelError> {
        if origin == Origin::Internal {
            tracing::debug!("Internal request, focusing existing surface");
            return self.windows.focus().await;
        }

        let state = self.gather_state().await;
        if !state.token_valid {
            tracing::info!("External request with invalid token, routing to login");
            self.windows.show(&Target::Login, "0").await
        } else if state.session_active {
            tracing::debug!("External request with live session, focusing");
            self.windows.focus().await
        } else {
            tracing::warn!("External request with stale session, locking wallet");
            self.lock_wallet().await;
            self.windows.show(&Target::Login, "0").await
        }
    }

    /// Gather a fresh security snapshot.
    ///
    /// Any failure yields the most restrictive state. A token that fails
    /// verification also force-ends the session and locks the wallet so the
    /// stale credential cannot be retried.
    pub async fn gather_state(&self) -> SecurityState {
        let settings = match self.settings.load().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!("Failed to load settings, assuming locked: {e}");
                return SecurityState::most_restrictive();
            }
        };

        let token_valid = match self.session.current_token().await {
            Some(token) => match self.session.verify_token(token.expose_secret()).await {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Current token failed verification: {e}");
                    self.lock_wallet().await;
                    false
                }
            },
            None => false,
        };
        let session_active = self.session.is_active().await;

        SecurityState {
            wallet_locked: settings.locked,
            token_valid,
            session_active,
            is_initialized: settings.initialized,
            terms_accepted: settings.terms_accepted,
        }
    }

    /// End the session and persist the locked flag.
    async fn lock_wallet(&self) {
        self.session.end_session().await;
        match self.settings.load().await {
            Ok(mut settings) => {
                settings.locked = true;
                if let Err(e) = self.settings.save(&settings).await {
                    tracing::error!("Failed to persist locked state: {e}");
                }
            }
            Err(e) => tracing::error!("Failed to load settings while locking: {e}"),
        }
    }
}
