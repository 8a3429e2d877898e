//! Native-messaging helper for eID smart card authentication and signing.
//!
//! A browser extension sends length-prefixed JSON commands on stdin; the
//! helper drives card discovery, user confirmation and PIN entry, performs
//! the cryptographic operation and answers on stdout. See `app::App` for
//! the session lifecycle and `controller::Controller` for the per-command
//! state machine.

pub mod app;
pub mod card;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod framing;
pub mod pin;
pub mod ui;

pub use config::Config;
pub use error::{CommandError, RetryReason};
