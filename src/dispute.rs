//! Dispute lifecycle management.
//!
//! The dispute book owns every [`DisputeRecord`] and drives authorization
//! state through the ledger's transition API: raising a dispute parks the
//! authorization as `disputed` and pulls it out of the settlement queue;
//! resolving it either reinstates the authorization for settlement or
//! leaves it disputed forever.

use std::collections::HashMap;
use uuid::Uuid;

use crate::ledger::AuthorizationLedger;
use crate::timestamp::UnixMillis;
use crate::types::{
    AuthorizationStatus, DisputeRecord, DisputeRequest, DisputeResolution, DisputeStatus,
};

/// Errors returned by dispute operations. Display strings are part of the
/// API contract.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DisputeError {
    #[error("Authorization not found")]
    AuthorizationNotFound,
    #[error("Agent address mismatch")]
    AgentMismatch,
    #[error("Already settled")]
    AlreadySettled,
    #[error("Dispute already open for authorization")]
    AlreadyOpen,
    #[error("Dispute not found")]
    DisputeNotFound,
    #[error("Dispute already resolved")]
    AlreadyResolved,
}

#[derive(Debug, Default)]
pub struct DisputeBook {
    disputes: HashMap<String, DisputeRecord>,
    order: Vec<String>,
}

impl DisputeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a dispute against an authorization.
    ///
    /// The authorization must exist, belong to the calling agent, not be
    /// settled already, and not have another dispute open. On success the
    /// authorization becomes `disputed` and leaves the settlement queue.
    pub fn create(
        &mut self,
        ledger: &mut AuthorizationLedger,
        request: DisputeRequest,
    ) -> Result<DisputeRecord, DisputeError> {
        let auth = ledger
            .get(&request.authorization_id)
            .ok_or(DisputeError::AuthorizationNotFound)?;
        if auth.agent_address != request.agent_address {
            return Err(DisputeError::AgentMismatch);
        }
        if auth.status == AuthorizationStatus::Settled {
            return Err(DisputeError::AlreadySettled);
        }
        if self.has_open_dispute(&request.authorization_id) {
            return Err(DisputeError::AlreadyOpen);
        }
        let merchant_address = auth.merchant_address.clone();

        ledger
            .mark_disputed(&request.authorization_id)
            .map_err(|_| DisputeError::AuthorizationNotFound)?;

        let record = DisputeRecord {
            id: format!("dispute_{}", Uuid::now_v7()),
            authorization_id: request.authorization_id,
            agent_address: request.agent_address,
            merchant_address,
            reason: request.reason,
            evidence: request.evidence,
            status: DisputeStatus::Pending,
            created_at: UnixMillis::now(),
            resolved_at: None,
            resolution: None,
        };
        tracing::info!(
            dispute = %record.id,
            authorization = %record.authorization_id,
            agent = %record.agent_address,
            "dispute opened"
        );
        self.order.push(record.id.clone());
        self.disputes.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    /// Resolve a dispute.
    ///
    /// `rejected` (merchant wins) returns the authorization to `validated`
    /// and re-queues it; `approved` (agent wins) leaves it `disputed`, so it
    /// can never settle.
    pub fn resolve(
        &mut self,
        ledger: &mut AuthorizationLedger,
        dispute_id: &str,
        resolution: DisputeResolution,
        note: Option<String>,
    ) -> Result<DisputeRecord, DisputeError> {
        let authorization_id = {
            let record = self
                .disputes
                .get(dispute_id)
                .ok_or(DisputeError::DisputeNotFound)?;
            if record.status == DisputeStatus::Resolved {
                return Err(DisputeError::AlreadyResolved);
            }
            record.authorization_id.clone()
        };

        if resolution == DisputeResolution::Rejected {
            ledger
                .reinstate_disputed(&authorization_id)
                .map_err(|_| DisputeError::AuthorizationNotFound)?;
        }

        let record = self
            .disputes
            .get_mut(dispute_id)
            .ok_or(DisputeError::DisputeNotFound)?;
        record.status = DisputeStatus::Resolved;
        record.resolved_at = Some(UnixMillis::now());
        record.resolution = note;
        tracing::info!(dispute = %dispute_id, ?resolution, "dispute resolved");
        Ok(record.clone())
    }

    pub fn get(&self, id: &str) -> Option<&DisputeRecord> {
        self.disputes.get(id)
    }

    /// Disputes in creation order, optionally filtered by agent.
    pub fn list(&self, agent: Option<&str>) -> Vec<DisputeRecord> {
        self.order
            .iter()
            .filter_map(|id| self.disputes.get(id))
            .filter(|record| agent.is_none_or(|a| record.agent_address == a))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DisputeRecord> {
        self.order.iter().filter_map(|id| self.disputes.get(id))
    }

    fn has_open_dispute(&self, authorization_id: &str) -> bool {
        self.disputes.values().any(|record| {
            record.authorization_id == authorization_id
                && record.status != DisputeStatus::Resolved
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::expected_signature;
    use crate::types::{Authorization, SettlementThreshold};

    fn seeded_ledger(id: &str) -> AuthorizationLedger {
        let mut ledger = AuthorizationLedger::new();
        let now = UnixMillis::now();
        let mut auth = Authorization {
            id: id.to_string(),
            agent_address: "agentA".to_string(),
            merchant_address: "merchantM".to_string(),
            tool_name: "search".to_string(),
            amount: "0.5".to_string(),
            currency: "USDC".to_string(),
            timestamp: now,
            expires_at: now + 600_000,
            nonce: "nonce-1".to_string(),
            signature: String::new(),
            status: AuthorizationStatus::Pending,
            data_hash: None,
        };
        auth.signature = expected_signature(&auth);
        ledger.verify(auth).unwrap();
        ledger
            .queue_for_settlement(id, &SettlementThreshold::default())
            .unwrap();
        ledger
    }

    fn request(id: &str) -> DisputeRequest {
        DisputeRequest {
            authorization_id: id.to_string(),
            agent_address: "agentA".to_string(),
            reason: "Data quality issue".to_string(),
            evidence: None,
        }
    }

    #[test]
    fn create_parks_authorization_and_dequeues() {
        let mut ledger = seeded_ledger("auth_a");
        let mut book = DisputeBook::new();
        let record = book.create(&mut ledger, request("auth_a")).unwrap();

        assert_eq!(record.status, DisputeStatus::Pending);
        assert_eq!(record.merchant_address, "merchantM");
        assert_eq!(
            ledger.get("auth_a").unwrap().status,
            AuthorizationStatus::Disputed
        );
        assert!(!ledger.is_queued("auth_a"));
    }

    #[test]
    fn create_rejects_wrong_agent_and_unknown_authorization() {
        let mut ledger = seeded_ledger("auth_a");
        let mut book = DisputeBook::new();

        let mut wrong_agent = request("auth_a");
        wrong_agent.agent_address = "agentB".to_string();
        assert_eq!(
            book.create(&mut ledger, wrong_agent).unwrap_err(),
            DisputeError::AgentMismatch
        );
        assert_eq!(
            book.create(&mut ledger, request("auth_missing")).unwrap_err(),
            DisputeError::AuthorizationNotFound
        );
    }

    #[test]
    fn create_rejects_second_open_dispute() {
        let mut ledger = seeded_ledger("auth_a");
        let mut book = DisputeBook::new();
        book.create(&mut ledger, request("auth_a")).unwrap();
        assert_eq!(
            book.create(&mut ledger, request("auth_a")).unwrap_err(),
            DisputeError::AlreadyOpen
        );
    }

    #[test]
    fn rejected_resolution_reinstates_for_settlement() {
        let mut ledger = seeded_ledger("auth_a");
        let mut book = DisputeBook::new();
        let record = book.create(&mut ledger, request("auth_a")).unwrap();

        let resolved = book
            .resolve(
                &mut ledger,
                &record.id,
                DisputeResolution::Rejected,
                Some("Data was valid".to_string()),
            )
            .unwrap();
        assert_eq!(resolved.status, DisputeStatus::Resolved);
        assert_eq!(resolved.resolution.as_deref(), Some("Data was valid"));
        assert!(resolved.resolved_at.is_some());
        assert_eq!(
            ledger.get("auth_a").unwrap().status,
            AuthorizationStatus::Validated
        );
        assert!(ledger.is_queued("auth_a"));
    }

    #[test]
    fn approved_resolution_keeps_authorization_disputed() {
        let mut ledger = seeded_ledger("auth_a");
        let mut book = DisputeBook::new();
        let record = book.create(&mut ledger, request("auth_a")).unwrap();

        book.resolve(&mut ledger, &record.id, DisputeResolution::Approved, None)
            .unwrap();
        assert_eq!(
            ledger.get("auth_a").unwrap().status,
            AuthorizationStatus::Disputed
        );
        assert!(!ledger.is_queued("auth_a"));
    }

    #[test]
    fn resolve_guards() {
        let mut ledger = seeded_ledger("auth_a");
        let mut book = DisputeBook::new();
        let record = book.create(&mut ledger, request("auth_a")).unwrap();
        book.resolve(&mut ledger, &record.id, DisputeResolution::Approved, None)
            .unwrap();

        assert_eq!(
            book.resolve(&mut ledger, &record.id, DisputeResolution::Rejected, None)
                .unwrap_err(),
            DisputeError::AlreadyResolved
        );
        assert_eq!(
            book.resolve(&mut ledger, "dispute_missing", DisputeResolution::Rejected, None)
                .unwrap_err(),
            DisputeError::DisputeNotFound
        );
    }

    #[test]
    fn list_filters_by_agent() {
        let mut ledger = seeded_ledger("auth_a");
        let mut book = DisputeBook::new();
        book.create(&mut ledger, request("auth_a")).unwrap();

        assert_eq!(book.list(None).len(), 1);
        assert_eq!(book.list(Some("agentA")).len(), 1);
        assert!(book.list(Some("agentB")).is_empty());
    }
}
