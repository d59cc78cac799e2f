//! Read access to leads and their organization context.
//!
//! Leads, organizations, AI configurations and status taxonomies are owned
//! by other components; the insert methods exist so those components (and
//! tests) can seed the shared store.

use std::sync::Arc;

use chrono::Utc;

use crate::models::lead::{
    AiConfiguration, Lead, LeadStatus, LeadStatusKind, LeadStatusTaxonomy, Organization,
};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_db_timestamp, to_db_timestamp};

/// Repository for lead-side records consulted during delivery.
#[derive(Clone)]
pub struct LeadRepo {
    db: Arc<Database>,
}

#[derive(sqlx::FromRow)]
struct LeadRow {
    id: String,
    organization_id: String,
    name: String,
    phone: Option<String>,
    email: Option<String>,
    status: String,
    metadata: Option<String>,
    created_at: String,
    updated_at: String,
}

impl LeadRow {
    fn into_lead(self) -> Result<Lead> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| AppError::Db(format!("invalid lead metadata: {e}")))?;

        Ok(Lead {
            created_at: parse_db_timestamp("created_at", &self.created_at)?,
            updated_at: parse_db_timestamp("updated_at", &self.updated_at)?,
            id: self.id,
            organization_id: self.organization_id,
            name: self.name,
            phone: self.phone,
            email: self.email,
            status: self.status,
            metadata,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrganizationRow {
    id: String,
    name: String,
    settings: Option<String>,
}

#[derive(sqlx::FromRow)]
struct LeadStatusRow {
    organization_id: String,
    key: String,
    name: String,
    kind: String,
    position: i64,
}

fn parse_kind(s: &str) -> Result<LeadStatusKind> {
    match s {
        "new" => Ok(LeadStatusKind::New),
        "conversation_started" => Ok(LeadStatusKind::ConversationStarted),
        "custom" => Ok(LeadStatusKind::Custom),
        "finished" => Ok(LeadStatusKind::Finished),
        other => Err(AppError::Db(format!("invalid lead status kind: {other}"))),
    }
}

fn kind_str(kind: LeadStatusKind) -> &'static str {
    match kind {
        LeadStatusKind::New => "new",
        LeadStatusKind::ConversationStarted => "conversation_started",
        LeadStatusKind::Custom => "custom",
        LeadStatusKind::Finished => "finished",
    }
}

fn json_column(value: Option<&serde_json::Value>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| AppError::Db(format!("serialize json column: {e}")))
}

impl LeadRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert an organization.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_organization(&self, org: &Organization) -> Result<()> {
        sqlx::query("INSERT INTO organizations (id, name, settings) VALUES (?1, ?2, ?3)")
            .bind(&org.id)
            .bind(&org.name)
            .bind(json_column(org.settings.as_ref())?)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Insert an AI configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_ai_configuration(&self, config: &AiConfiguration) -> Result<()> {
        sqlx::query(
            "INSERT INTO ai_configurations (id, organization_id, name, prompt, model, webhook_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&config.id)
        .bind(&config.organization_id)
        .bind(&config.name)
        .bind(&config.prompt)
        .bind(&config.model)
        .bind(&config.webhook_url)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Insert one lead-status taxonomy entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_status(&self, status: &LeadStatus) -> Result<()> {
        sqlx::query(
            "INSERT INTO lead_statuses (organization_id, key, name, kind, position)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&status.organization_id)
        .bind(&status.key)
        .bind(&status.name)
        .bind(kind_str(status.kind))
        .bind(status.position)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Insert a lead.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_lead(&self, lead: &Lead) -> Result<()> {
        sqlx::query(
            "INSERT INTO leads (id, organization_id, name, phone, email, status, metadata,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&lead.id)
        .bind(&lead.organization_id)
        .bind(&lead.name)
        .bind(&lead.phone)
        .bind(&lead.email)
        .bind(&lead.status)
        .bind(json_column(lead.metadata.as_ref())?)
        .bind(to_db_timestamp(lead.created_at))
        .bind(to_db_timestamp(lead.updated_at))
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Retrieve a lead by ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_lead(&self, id: &str) -> Result<Option<Lead>> {
        let row: Option<LeadRow> = sqlx::query_as("SELECT * FROM leads WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        row.map(LeadRow::into_lead).transpose()
    }

    /// Retrieve an organization by ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or the settings column fails to parse.
    pub async fn get_organization(&self, id: &str) -> Result<Option<Organization>> {
        let row: Option<OrganizationRow> =
            sqlx::query_as("SELECT * FROM organizations WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(|row| {
            let settings = row
                .settings
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| AppError::Db(format!("invalid organization settings: {e}")))?;
            Ok(Organization {
                id: row.id,
                name: row.name,
                settings,
            })
        })
        .transpose()
    }

    /// Retrieve an AI configuration by ID.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_ai_configuration(&self, id: &str) -> Result<Option<AiConfiguration>> {
        let row: Option<(String, String, String, String, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT id, organization_id, name, prompt, model, webhook_url
                 FROM ai_configurations WHERE id = ?1",
            )
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        Ok(row.map(
            |(id, organization_id, name, prompt, model, webhook_url)| AiConfiguration {
                id,
                organization_id,
                name,
                prompt,
                model,
                webhook_url,
            },
        ))
    }

    /// Load an organization's status taxonomy ordered by position.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_statuses(&self, organization_id: &str) -> Result<LeadStatusTaxonomy> {
        let rows: Vec<LeadStatusRow> = sqlx::query_as(
            "SELECT * FROM lead_statuses WHERE organization_id = ?1 ORDER BY position ASC",
        )
        .bind(organization_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(LeadStatus {
                    kind: parse_kind(&row.kind)?,
                    organization_id: row.organization_id,
                    key: row.key,
                    name: row.name,
                    position: row.position,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(LeadStatusTaxonomy)
    }

    /// Move a lead from `from` to `to` only if it is still in `from`.
    ///
    /// Returns `false` when the lead had already moved on.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn advance_status(&self, lead_id: &str, from: &str, to: &str) -> Result<bool> {
        let now = to_db_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE leads SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
        )
        .bind(to)
        .bind(&now)
        .bind(lead_id)
        .bind(from)
        .execute(self.db.as_ref())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
