//! Sluice Core - request model, sessions, rules and configuration.
//!
//! This crate holds everything the proxy pipeline needs that does not touch
//! a socket.

pub mod config;
pub mod error;
pub mod notifications;
pub mod request;
pub mod rules;
pub mod session;
pub mod store;

pub use config::{ListenerConfig, TaskConfig};
pub use error::{CoreError, Result};
pub use notifications::{ListenerState, NotificationResult, Notifier, StatusEvent};
pub use request::{origin_form, NetRequest};
pub use rules::{DefaultStrategy, HostRule, HostRuleSet, RulePredicate};
pub use session::{Protocol, Session};
pub use store::{MemoryStore, NullStore, SessionStore};
