#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::doc_markdown
)]

//! Token issuance and privacy-preserving identifier lookup.
//!
//! - [`tokens::TokenStore`]: durable and single-use tokens
//! - [`reaper`]: periodic delete of expired tokens
//! - [`pepper::PepperManager`]: rotating lookup salt with a one-interval grace period
//! - [`lookup::LookupResolver`]: salted-hash batch → identifier mapping
//! - [`backend`]: SQLite (default) and PostgreSQL storage behind one trait
//!
//! [`Engine`] wires all of it from a [`Config`].

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod pepper;
pub mod reaper;
pub mod scheduler;
pub mod tokens;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
