//! Two-phase commit for gated actions.
//!
//! A pending action runs only after a caller presents its token together with
//! an explicit acknowledgement. The claim is a conditional update on
//! `confirmed_at`, so of two concurrent confirms at most one performs the
//! effect. A failed effect releases the claim for a later retry.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::processor::RuleEngine;
use crate::domain::pending::tokens_match;
use crate::domain::rule::validate_tenant;
use crate::domain::PendingAction;
use crate::error::{EngineError, Result};

/// Confirmation input
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfirmRequest {
    pub pending_id: i64,
    pub token: String,

    /// Explicit acknowledgement that a real effect will happen
    #[serde(default)]
    pub ack: bool,
}

/// Confirmation outcome. Well-formed confirms whose effect failed come back
/// as `ok: false` with the error code; the action stays confirmable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmResult {
    pub ok: bool,
    pub pending_id: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RuleEngine {
    /// Pending actions of a tenant, newest first
    pub fn list_pending(&self, tenant_id: &str, include_confirmed: bool) -> Result<Vec<PendingAction>> {
        validate_tenant(tenant_id)?;
        self.db.list_pending(tenant_id, include_confirmed)
    }

    /// One pending action; other tenants' ids are `NotFound`
    pub fn get_pending(&self, tenant_id: &str, pending_id: i64) -> Result<PendingAction> {
        validate_tenant(tenant_id)?;
        self.db.get_pending(tenant_id, pending_id)
    }

    /// Confirm a pending action and perform its effect.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, pending_id = request.pending_id))]
    pub async fn confirm(&self, tenant_id: &str, request: &ConfirmRequest) -> Result<ConfirmResult> {
        validate_tenant(tenant_id)?;
        if !request.ack {
            return Err(EngineError::AcknowledgementRequired);
        }

        let pending = self.db.get_pending(tenant_id, request.pending_id)?;
        if !tokens_match(&pending.confirm_token, &request.token) {
            warn!("Confirm token mismatch");
            return Err(EngineError::ConfirmTokenMismatch);
        }
        if pending.is_confirmed() {
            return Err(EngineError::AlreadyConfirmed);
        }

        let claimed = self
            .storage_retry("claim_pending", || self.db.claim_pending(tenant_id, pending.id, Utc::now()))
            .await?;
        if !claimed {
            return Err(EngineError::AlreadyConfirmed);
        }

        match self.executor.perform_confirmed(&pending).await {
            Ok(reference) => {
                self.storage_retry("complete_pending", || self.db.complete_pending(tenant_id, pending.id, &reference))
                    .await?;
                info!(action = %pending.action_type, "Pending action confirmed");
                Ok(ConfirmResult {
                    ok: true,
                    pending_id: pending.id,
                    reference: Some(reference),
                    error: None,
                })
            }
            Err(e) => {
                let code = e.code();
                self.storage_retry("release_pending", || self.db.release_pending(tenant_id, pending.id, &code))
                    .await?;
                warn!(action = %pending.action_type, error = %code, "Confirmed action failed, claim released");
                match e {
                    EngineError::Database(_) | EngineError::Serialization(_) => Err(e),
                    _ => Ok(ConfirmResult {
                        ok: false,
                        pending_id: pending.id,
                        reference: None,
                        error: Some(code),
                    }),
                }
            }
        }
    }
}
