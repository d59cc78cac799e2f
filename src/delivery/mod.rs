//! Delivery of assembled interaction context to the external AI service.

pub mod context;
pub mod webhook;

use crate::broker::BoxFuture;
use crate::Result;

pub use context::InteractionContext;

/// External target invoked once per claimed interaction.
///
/// Implementations must not retry internally; every error is terminal for
/// the interaction.
pub trait DeliveryTarget: Send + Sync {
    /// Deliver `context` to `url`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Delivery` if the target is unreachable, times
    /// out, or answers with a non-success status.
    fn deliver<'a>(
        &'a self,
        url: &'a str,
        context: &'a InteractionContext,
    ) -> BoxFuture<'a, Result<()>>;
}
