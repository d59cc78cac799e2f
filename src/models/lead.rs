//! Lead, organization, AI configuration and lead-status taxonomy snapshots.
//!
//! These entities are owned by other components. The pipeline reads them to
//! assemble the delivery context and performs exactly one mutation: moving a
//! lead out of its organization's `new` status after a successful delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fallback key used when an organization defines no `conversation_started` status.
pub const CONVERSATION_STARTED_KEY: &str = "conversation_started";

/// Role a status plays within an organization's taxonomy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatusKind {
    /// Entry status for freshly imported leads (mandatory, one per organization).
    New,
    /// A conversation has been opened with the lead.
    ConversationStarted,
    /// Organization-defined intermediate status.
    Custom,
    /// Terminal status (mandatory, one per organization).
    Finished,
}

/// One entry of an organization's ordered lead-status taxonomy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LeadStatus {
    /// Owning organization.
    pub organization_id: String,
    /// Stable key stored on leads.
    pub key: String,
    /// Display name.
    pub name: String,
    /// Taxonomy role.
    pub kind: LeadStatusKind,
    /// Sort order within the organization.
    pub position: i64,
}

/// The organization-scoped status taxonomy, ordered by position.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LeadStatusTaxonomy(pub Vec<LeadStatus>);

impl LeadStatusTaxonomy {
    /// Key of the organization's `new`-equivalent status.
    #[must_use]
    pub fn new_key(&self) -> Option<&str> {
        self.key_of(LeadStatusKind::New)
    }

    /// Key a lead moves to after the first scheduled contact.
    #[must_use]
    pub fn conversation_started_key(&self) -> &str {
        self.key_of(LeadStatusKind::ConversationStarted)
            .unwrap_or(CONVERSATION_STARTED_KEY)
    }

    fn key_of(&self, kind: LeadStatusKind) -> Option<&str> {
        self.0
            .iter()
            .find(|status| status.kind == kind)
            .map(|status| status.key.as_str())
    }
}

/// Lead snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    /// Unique identifier.
    pub id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Display name.
    pub name: String,
    /// Phone number or other primary contact.
    pub phone: Option<String>,
    /// Email address.
    pub email: Option<String>,
    /// Current status key within the organization's taxonomy.
    pub status: String,
    /// Free-form attributes imported with the lead.
    pub metadata: Option<serde_json::Value>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Organization snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    /// Unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form organization settings.
    pub settings: Option<serde_json::Value>,
}

/// AI configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AiConfiguration {
    /// Unique identifier.
    pub id: String,
    /// Owning organization.
    pub organization_id: String,
    /// Display name.
    pub name: String,
    /// Persona / system prompt handed to the AI service.
    pub prompt: String,
    /// Model identifier.
    pub model: Option<String>,
    /// Delivery target overriding the global default.
    pub webhook_url: Option<String>,
}
