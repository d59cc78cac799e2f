//! HTTP webhook delivery target.

use std::time::Duration;

use tracing::{debug, warn};

use super::{DeliveryTarget, InteractionContext};
use crate::broker::BoxFuture;
use crate::{AppError, Result};

/// Header carrying the interaction id so the target can deduplicate.
pub const INTERACTION_ID_HEADER: &str = "x-interaction-id";

const MAX_ERROR_BODY: usize = 200;

/// Posts the context as JSON; any 2xx counts as delivered.
pub struct WebhookTarget {
    client: reqwest::Client,
    token: Option<String>,
}

impl WebhookTarget {
    /// Build a target whose every request is bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(timeout: Duration, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self { client, token })
    }
}

impl DeliveryTarget for WebhookTarget {
    fn deliver<'a>(
        &'a self,
        url: &'a str,
        context: &'a InteractionContext,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut request = self
                .client
                .post(url)
                .header(INTERACTION_ID_HEADER, context.interaction.id.as_str())
                .json(context);
            if let Some(ref token) = self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                debug!(%status, url, "webhook accepted interaction");
                return Ok(());
            }

            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(MAX_ERROR_BODY).collect();
            warn!(%status, url, "webhook rejected interaction");
            Err(AppError::Delivery(format!(
                "target answered {status}: {snippet}"
            )))
        })
    }
}
