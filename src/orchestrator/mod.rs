//! Delivery orchestration.
//!
//! Covers the shared claim-then-deliver sequence and the two paths that
//! invoke it: the broker consumer and the reconciling poller.

pub mod broker_consumer;
pub mod dispatcher;
pub mod reconciler;
