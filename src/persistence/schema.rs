//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS`, so this is safe to
//! re-run on every server startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table definitions to the connected `SQLite` database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS organizations (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    settings        TEXT
);

CREATE TABLE IF NOT EXISTS ai_configurations (
    id              TEXT PRIMARY KEY NOT NULL,
    organization_id TEXT NOT NULL,
    name            TEXT NOT NULL,
    prompt          TEXT NOT NULL,
    model           TEXT,
    webhook_url     TEXT
);

CREATE TABLE IF NOT EXISTS lead_statuses (
    organization_id TEXT NOT NULL,
    key             TEXT NOT NULL,
    name            TEXT NOT NULL,
    kind            TEXT NOT NULL CHECK(kind IN ('new','conversation_started','custom','finished')),
    position        INTEGER NOT NULL,
    PRIMARY KEY (organization_id, key)
);

CREATE TABLE IF NOT EXISTS leads (
    id              TEXT PRIMARY KEY NOT NULL,
    organization_id TEXT NOT NULL,
    name            TEXT NOT NULL,
    phone           TEXT,
    email           TEXT,
    status          TEXT NOT NULL,
    metadata        TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS scheduled_interactions (
    id                  TEXT PRIMARY KEY NOT NULL,
    lead_id             TEXT NOT NULL,
    ai_configuration_id TEXT NOT NULL,
    channel_instance    TEXT NOT NULL,
    destination_address TEXT NOT NULL,
    scheduled_at        TEXT NOT NULL,
    status              TEXT NOT NULL CHECK(status IN ('pending','claimed','delivered','failed')),
    claimed_at          TEXT,
    claimed_by          TEXT CHECK(claimed_by IN ('broker','poller','manual')),
    last_error          TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_interactions_due ON scheduled_interactions(status, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_interactions_lead ON scheduled_interactions(lead_id);
CREATE INDEX IF NOT EXISTS idx_leads_org ON leads(organization_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
