//! Scheduled interaction repository for `SQLite` persistence.
//!
//! Every status change is a single conditional `UPDATE` guarded by the
//! expected current status. The affected-row count tells the caller
//! whether it won; there is no read-then-write anywhere in this file.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::interaction::{ClaimSource, InteractionStatus, ScheduledInteraction};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_db_timestamp, to_db_timestamp};

/// Claimable and due by the cutoff bound as `?1`.
macro_rules! due_by_first_param {
    () => {
        "status = 'pending' AND scheduled_at <= ?1"
    };
}

/// Repository wrapper around `SQLite` for scheduled interaction records.
#[derive(Clone)]
pub struct InteractionRepo {
    db: Arc<Database>,
}

/// Number of rows per status.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct StatusCounts {
    /// Rows awaiting a claim.
    pub pending: i64,
    /// Rows claimed and not yet finalized.
    pub claimed: i64,
    /// Rows delivered.
    pub delivered: i64,
    /// Rows failed.
    pub failed: i64,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct InteractionRow {
    id: String,
    lead_id: String,
    ai_configuration_id: String,
    channel_instance: String,
    destination_address: String,
    scheduled_at: String,
    status: String,
    claimed_at: Option<String>,
    claimed_by: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InteractionRow {
    /// Convert a database row into the domain model.
    fn into_interaction(self) -> Result<ScheduledInteraction> {
        Ok(ScheduledInteraction {
            status: parse_status(&self.status)?,
            scheduled_at: parse_db_timestamp("scheduled_at", &self.scheduled_at)?,
            claimed_at: self
                .claimed_at
                .as_deref()
                .map(|raw| parse_db_timestamp("claimed_at", raw))
                .transpose()?,
            claimed_by: self.claimed_by.as_deref().map(parse_source).transpose()?,
            created_at: parse_db_timestamp("created_at", &self.created_at)?,
            updated_at: parse_db_timestamp("updated_at", &self.updated_at)?,
            id: self.id,
            lead_id: self.lead_id,
            ai_configuration_id: self.ai_configuration_id,
            channel_instance: self.channel_instance,
            destination_address: self.destination_address,
            last_error: self.last_error,
        })
    }
}

fn parse_status(s: &str) -> Result<InteractionStatus> {
    match s {
        "pending" => Ok(InteractionStatus::Pending),
        "claimed" => Ok(InteractionStatus::Claimed),
        "delivered" => Ok(InteractionStatus::Delivered),
        "failed" => Ok(InteractionStatus::Failed),
        other => Err(AppError::Db(format!("invalid interaction status: {other}"))),
    }
}

fn status_str(s: InteractionStatus) -> &'static str {
    match s {
        InteractionStatus::Pending => "pending",
        InteractionStatus::Claimed => "claimed",
        InteractionStatus::Delivered => "delivered",
        InteractionStatus::Failed => "failed",
    }
}

fn parse_source(s: &str) -> Result<ClaimSource> {
    match s {
        "broker" => Ok(ClaimSource::Broker),
        "poller" => Ok(ClaimSource::Poller),
        "manual" => Ok(ClaimSource::Manual),
        other => Err(AppError::Db(format!("invalid claim source: {other}"))),
    }
}

fn source_str(s: ClaimSource) -> &'static str {
    match s {
        ClaimSource::Broker => "broker",
        ClaimSource::Poller => "poller",
        ClaimSource::Manual => "manual",
    }
}

impl InteractionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new scheduled interaction record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the database insert fails.
    pub async fn create(&self, item: &ScheduledInteraction) -> Result<ScheduledInteraction> {
        sqlx::query(
            "INSERT INTO scheduled_interactions (id, lead_id, ai_configuration_id,
             channel_instance, destination_address, scheduled_at, status, claimed_at,
             claimed_by, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&item.id)
        .bind(&item.lead_id)
        .bind(&item.ai_configuration_id)
        .bind(&item.channel_instance)
        .bind(&item.destination_address)
        .bind(to_db_timestamp(item.scheduled_at))
        .bind(status_str(item.status))
        .bind(item.claimed_at.map(to_db_timestamp))
        .bind(item.claimed_by.map(source_str))
        .bind(&item.last_error)
        .bind(to_db_timestamp(item.created_at))
        .bind(to_db_timestamp(item.updated_at))
        .execute(self.db.as_ref())
        .await?;

        Ok(item.clone())
    }

    /// Retrieve a scheduled interaction by its ID.
    ///
    /// Returns `Ok(None)` if the record does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ScheduledInteraction>> {
        let row: Option<InteractionRow> =
            sqlx::query_as("SELECT * FROM scheduled_interactions WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(InteractionRow::into_interaction).transpose()
    }

    /// List interactions [`claim`](Self::claim) would accept for `due_by`,
    /// oldest `scheduled_at` first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_due(
        &self,
        due_by: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ScheduledInteraction>> {
        let rows: Vec<InteractionRow> = sqlx::query_as(concat!(
            "SELECT * FROM scheduled_interactions WHERE ",
            due_by_first_param!(),
            " ORDER BY scheduled_at ASC LIMIT ?2",
        ))
        .bind(to_db_timestamp(due_by))
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(InteractionRow::into_interaction).collect()
    }

    /// Atomically move an interaction from `pending` to `claimed`.
    ///
    /// Succeeds only if the row is still `pending` and its `scheduled_at`
    /// is at or before `due_by`. Returns `false` when another actor already
    /// claimed it, it is not yet due, or it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn claim(
        &self,
        id: &str,
        due_by: DateTime<Utc>,
        source: ClaimSource,
    ) -> Result<bool> {
        let now = to_db_timestamp(Utc::now());
        let result = sqlx::query(concat!(
            "UPDATE scheduled_interactions
             SET status = 'claimed', claimed_at = ?2, claimed_by = ?3, updated_at = ?2
             WHERE id = ?4 AND ",
            due_by_first_param!(),
        ))
        .bind(to_db_timestamp(due_by))
        .bind(&now)
        .bind(source_str(source))
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finalize a claimed interaction as `delivered`.
    ///
    /// Returns `false` if the row was not `claimed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_delivered(&self, id: &str) -> Result<bool> {
        let now = to_db_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE scheduled_interactions
             SET status = 'delivered', last_error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'claimed'",
        )
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Finalize a claimed interaction as `failed`, recording the reason.
    ///
    /// Returns `false` if the row was not `claimed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_failed(&self, id: &str, reason: &str) -> Result<bool> {
        let now = to_db_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE scheduled_interactions
             SET status = 'failed', last_error = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'claimed'",
        )
        .bind(reason)
        .bind(&now)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Fail every interaction left `claimed` since before `claimed_before`.
    ///
    /// Returns the number of rows failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn fail_stale_claims(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let now = to_db_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE scheduled_interactions
             SET status = 'failed', last_error = 'claim expired before completion', updated_at = ?1
             WHERE status = 'claimed' AND claimed_at < ?2",
        )
        .bind(&now)
        .bind(to_db_timestamp(claimed_before))
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected())
    }

    /// Count rows per status.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count_by_status(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM scheduled_interactions GROUP BY status",
        )
        .fetch_all(self.db.as_ref())
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match parse_status(&status)? {
                InteractionStatus::Pending => counts.pending = count,
                InteractionStatus::Claimed => counts.claimed = count,
                InteractionStatus::Delivered => counts.delivered = count,
                InteractionStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}
