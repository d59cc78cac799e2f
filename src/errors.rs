//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Durable Store failure when interacting with `SQLite`.
    Db(String),
    /// Broker rejected or failed a single operation.
    Broker(String),
    /// Broker connection is unavailable; affects every pending publish.
    BrokerUnavailable(String),
    /// Prerequisite data for delivery is missing or unconfigured.
    Precondition(String),
    /// Delivery target unreachable, timed out, or answered with a non-success status.
    Delivery(String),
    /// Broker payload could not be encoded or decoded.
    Codec(String),
    /// IPC communication failure.
    Ipc(String),
    /// Request failed input validation.
    Validation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error aborts the current cycle instead of being
    /// contained within a single item.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Db(_) | Self::BrokerUnavailable(_) | Self::Io(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Broker(msg) => write!(f, "broker: {msg}"),
            Self::BrokerUnavailable(msg) => write!(f, "broker unavailable: {msg}"),
            Self::Precondition(msg) => write!(f, "precondition: {msg}"),
            Self::Delivery(msg) => write!(f, "delivery: {msg}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<lapin::Error> for AppError {
    fn from(err: lapin::Error) -> Self {
        Self::Broker(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Delivery(format!("request timed out: {err}"))
        } else {
            Self::Delivery(err.to_string())
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
