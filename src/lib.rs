//! Wallet session and signing-authorization core.
//!
//! This crate is the security backbone of a multi-surface wallet runtime:
//! a timed session with bearer tokens ([`session`]), a background token
//! watchdog that can force every surface to log out ([`validator`]), a
//! security router that decides which surface a request may reach
//! ([`router`]), a provider bridge correlating page requests with wallet
//! responses ([`bridge`]), a signing authorizer that binds signatures to
//! the session subject ([`signing`]), and idle lockdown ([`idle`]).
//!
//! Hosts wire the pieces together through the trait seams each module
//! exposes (`UiChannel`, `WindowManager`, `RequestTransport`,
//! `CredentialStore`, `LockdownHandler`); everything in here is
//! host-agnostic.

pub mod bridge;
pub mod channels;
pub mod error;
pub mod idle;
pub mod router;
pub mod session;
pub mod settings;
pub mod signing;
pub mod validator;

pub use error::{Error, Result};
