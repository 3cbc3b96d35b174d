//! Portcullis — credential and session security core.
//!
//! Storage-agnostic building blocks for password authentication:
//!
//! * [`rate_limit`] — per-identifier attempt limiting (fixed window, sliding
//!   window, token bucket) with failure-triggered lockouts and adaptive
//!   tightening.
//! * [`session`] — opaque-token sessions with concurrency caps, inactivity
//!   timeouts, and activity anomaly detection.
//! * [`token`] — single-use email-verification and password-reset tokens.
//! * [`password`] — complexity policy, reuse history, and expiration.
//! * [`auth`] — the [`auth::Authenticator`] orchestrator tying the above
//!   into sign-in, sign-up, and recovery flows.
//!
//! Persistence is injected through the traits in [`store`]; adapters for
//! Postgres ([`store::postgres::PgStore`]) and in-memory testing
//! ([`store::memory::MemoryStore`]) are included. Secrets never reach a
//! store in raw form: passwords are Argon2id hashes, session and
//! verification tokens are stored as SHA-256 digests.

pub mod auth;
pub mod config;
pub mod error;
pub mod hasher;
pub mod password;
pub mod rate_limit;
pub mod session;
pub mod store;
pub mod token;

mod util;

pub use auth::{Authenticator, LogMailSender, MailSender, SignIn, SignUp, Stores};
pub use config::AuthConfig;
pub use error::AuthError;
