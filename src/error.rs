//! Error taxonomy for the rule engine.
//!
//! Every failure the engine can report maps to a stable string code (what ends
//! up in `error_redacted` columns and API responses) and an HTTP-style status
//! for callers that expose the engine over a web boundary.

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::adapters::CollaboratorError;
use crate::core::condition::ConditionError;
use crate::core::cron::CronError;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Action type not allowed: {0}")]
    ActionNotAllowed(String),

    #[error("Rule {rule_id} exceeded its execution rate")]
    RateLimited { rule_id: i64 },

    #[error("Rule {rule_id} was triggered by its own output")]
    LoopDetected { rule_id: i64 },

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Recipient is not a known contact")]
    RecipientNotInCrm,

    #[error("Webhook host not allowed: {0}")]
    DomainNotAllowed(String),

    #[error("Webhook header not allowed: {0}")]
    HeaderNotAllowed(String),

    #[error("Template uses placeholders outside the allow-list: {}", .0.join(", "))]
    TemplateVariablesNotAllowed(Vec<String>),

    #[error("Subject too long: {actual} > {limit}")]
    SubjectTooLong { actual: usize, limit: usize },

    #[error("Body too long: {actual} > {limit}")]
    BodyTooLong { actual: usize, limit: usize },

    #[error("OAuth account unavailable: {0}")]
    OauthAccountUnavailable(String),

    #[error("Webhook returned HTTP {0}")]
    WebhookHttp(u16),

    #[error("Webhook returned HTTP {0} after retry")]
    WebhookTransientHttp(u16),

    #[error("Confirm token does not match")]
    ConfirmTokenMismatch,

    #[error("Pending action already confirmed")]
    AlreadyConfirmed,

    #[error("Explicit safety acknowledgement required")]
    AcknowledgementRequired,

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Stable machine-readable code.
    pub fn code(&self) -> String {
        match self {
            Self::Validation(_) => "validation_error".to_string(),
            Self::AlreadyExists(_) => "already_exists".to_string(),
            Self::NotFound(_) => "not_found".to_string(),
            Self::ActionNotAllowed(_) => "action_not_allowed".to_string(),
            Self::RateLimited { .. } => "rate_limited".to_string(),
            Self::LoopDetected { .. } => "loop_detected".to_string(),
            Self::Transient(detail) => format!("error_transient:{}", detail),
            Self::Permanent(detail) => format!("error_permanent:{}", detail),
            Self::RecipientNotInCrm => "recipient_not_in_crm".to_string(),
            Self::DomainNotAllowed(_) => "domain_not_allowed".to_string(),
            Self::HeaderNotAllowed(_) => "header_not_allowed".to_string(),
            Self::TemplateVariablesNotAllowed(_) => "template_variables_not_allowed".to_string(),
            Self::SubjectTooLong { .. } => "subject_too_long".to_string(),
            Self::BodyTooLong { .. } => "body_too_long".to_string(),
            Self::OauthAccountUnavailable(_) => "oauth_account_unavailable".to_string(),
            Self::WebhookHttp(status) => format!("webhook_http_{}", status),
            Self::WebhookTransientHttp(status) => format!("webhook_transient_http_{}", status),
            Self::ConfirmTokenMismatch => "confirm_token_mismatch".to_string(),
            Self::AlreadyConfirmed => "already_confirmed".to_string(),
            Self::AcknowledgementRequired => "ack_required".to_string(),
            Self::Cron(e) => e.code(),
            Self::Condition(_) => "condition_invalid".to_string(),
            Self::Database(_) => "error_permanent:database".to_string(),
            Self::Serialization(_) => "error_permanent:serialization".to_string(),
        }
    }

    /// HTTP-style status for callers exposing the engine over the web.
    ///
    /// Well-formed operations that failed for business reasons report 200 and
    /// carry `ok: false` in their body.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_)
            | Self::AlreadyExists(_)
            | Self::SubjectTooLong { .. }
            | Self::BodyTooLong { .. }
            | Self::Cron(_)
            | Self::Condition(_) => 400,

            Self::ActionNotAllowed(_)
            | Self::RateLimited { .. }
            | Self::LoopDetected { .. }
            | Self::RecipientNotInCrm
            | Self::DomainNotAllowed(_)
            | Self::HeaderNotAllowed(_)
            | Self::TemplateVariablesNotAllowed(_)
            | Self::ConfirmTokenMismatch
            | Self::AlreadyConfirmed
            | Self::AcknowledgementRequired => 403,

            Self::NotFound(_) => 404,

            Self::Transient(_)
            | Self::Permanent(_)
            | Self::OauthAccountUnavailable(_)
            | Self::WebhookHttp(_)
            | Self::WebhookTransientHttp(_) => 200,

            Self::Database(_) | Self::Serialization(_) => 500,
        }
    }

    /// Whether a single retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::WebhookTransientHttp(_))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                EngineError::Transient("storage_locked".to_string())
            }
            _ => EngineError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<CollaboratorError> for EngineError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Transient(detail) => EngineError::Transient(detail),
            CollaboratorError::Permanent(detail) => EngineError::Permanent(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).code(), "validation_error");
        assert_eq!(EngineError::RecipientNotInCrm.code(), "recipient_not_in_crm");
        assert_eq!(EngineError::Transient("timeout".into()).code(), "error_transient:timeout");
        assert_eq!(EngineError::WebhookHttp(404).code(), "webhook_http_404");
        assert_eq!(
            EngineError::WebhookTransientHttp(503).code(),
            "webhook_transient_http_503"
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(EngineError::Validation("x".into()).status_code(), 400);
        assert_eq!(EngineError::ConfirmTokenMismatch.status_code(), 403);
        assert_eq!(EngineError::NotFound("rule 1".into()).status_code(), 404);
        assert_eq!(EngineError::WebhookHttp(400).status_code(), 200);
    }

    #[test]
    fn test_busy_database_is_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let engine_err = EngineError::from(err);
        assert!(engine_err.is_transient());
        assert_eq!(engine_err.code(), "error_transient:storage_locked");
    }
}
