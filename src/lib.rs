#![forbid(unsafe_code)]

//! Delayed delivery of proactive AI interactions to leads.
//!
//! A scheduled interaction is persisted as `pending`, signalled through a
//! RabbitMQ TTL/dead-letter delay topology, and delivered by whichever of
//! two paths claims it first: the broker consumer (push) or the
//! reconciling poller (pull). The Durable Store's conditional claim is the
//! only coordination between them.

pub mod api;
pub mod broker;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod publisher;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
