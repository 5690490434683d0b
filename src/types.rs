//! Entity types for the deferred settlement facilitator.
//!
//! The key objects are [`Authorization`] (a signed promise to pay for one
//! paid API call), [`AgentUsage`] (per-agent accounting), [`SettlementBatch`]
//! (a group of authorizations settled in one on-chain transfer), and
//! [`DisputeRecord`]. Wire shapes use camelCase field names and are
//! compatible with x402-style agent SDKs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use crate::timestamp::UnixMillis;

/// Lifecycle state of a payment authorization.
///
/// `settled` and `expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    /// Verified and stored, not yet queued for settlement.
    Pending,
    /// Queued for settlement.
    Validated,
    /// Included in a completed settlement batch.
    Settled,
    /// Subject of an open or upheld dispute.
    Disputed,
    /// Swept after passing its expiry while still pending.
    Expired,
}

impl Default for AuthorizationStatus {
    fn default() -> Self {
        AuthorizationStatus::Pending
    }
}

impl Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Validated => "validated",
            AuthorizationStatus::Settled => "settled",
            AuthorizationStatus::Disputed => "disputed",
            AuthorizationStatus::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// A signed authorization to pay for a single paid API call.
///
/// Everything except `status` and `data_hash` is immutable after creation;
/// the signature covers the immutable fields (see [`crate::signature`]).
/// `amount` is kept as the decimal string the agent signed over.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub id: String,
    pub agent_address: String,
    pub merchant_address: String,
    pub tool_name: String,
    pub amount: String,
    pub currency: String,
    pub timestamp: UnixMillis,
    pub expires_at: UnixMillis,
    pub nonce: String,
    pub signature: String,
    #[serde(default)]
    pub status: AuthorizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_hash: Option<String>,
}

impl Authorization {
    /// The authorized amount as a decimal. Fails on a malformed amount
    /// string; the ledger rejects those at verification time.
    pub fn amount_decimal(&self) -> Result<Decimal, rust_decimal::Error> {
        Decimal::from_str(&self.amount)
    }
}

/// Per-agent accounting, derived from every successfully verified
/// authorization. `total_amount` is monotonic: it is never decremented when
/// an authorization later expires or is disputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentUsage {
    pub authorization_ids: Vec<String>,
    pub total_amount: Decimal,
    pub request_count: u64,
    pub first_request_at: UnixMillis,
    pub last_request_at: UnixMillis,
}

/// Lifecycle state of a settlement batch.
///
/// `completed` and `failed` are terminal; `processing` covers the window in
/// which the on-chain transfer is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A group of authorizations for one `(agent, merchant)` pair, settled in a
/// single on-chain transfer.
///
/// `authorizations` is a snapshot of the member records taken at batch
/// creation; member statuses in the snapshot are kept in step with the live
/// records as the batch completes or fails. All members share the agent,
/// merchant, and currency. `total_amount` is the member sum formatted to six
/// decimal places.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementBatch {
    pub id: String,
    pub agent_address: String,
    pub merchant_address: String,
    pub authorizations: Vec<Authorization>,
    pub total_amount: String,
    pub currency: String,
    pub status: BatchStatus,
    pub created_at: UnixMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<UnixMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SettlementBatch {
    pub fn total_decimal(&self) -> Result<Decimal, rust_decimal::Error> {
        Decimal::from_str(&self.total_amount)
    }
}

/// Lifecycle state of a dispute.
///
/// Only `pending` and `resolved` are reachable through the public API;
/// `investigating` and `rejected` are representable for operator tooling but
/// have no defined transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    Pending,
    Investigating,
    Resolved,
    Rejected,
}

/// Outcome of a dispute resolution.
///
/// The pairing is inverted relative to form intuition and must stay that
/// way: `approved` means the agent's claim is upheld and the authorization
/// stays `disputed` forever; `rejected` means the merchant wins and the
/// authorization returns to the settlement queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeResolution {
    Approved,
    Rejected,
}

/// A dispute raised by an agent against one of its authorizations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeRecord {
    pub id: String,
    pub authorization_id: String,
    pub agent_address: String,
    pub merchant_address: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<serde_json::Value>,
    pub status: DisputeStatus,
    pub created_at: UnixMillis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<UnixMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

/// Settlement trigger thresholds for a `(agent, merchant)` group of queued
/// authorizations. A group fires when any one bound is crossed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementThreshold {
    /// Cumulative queued amount that triggers settlement.
    pub amount_threshold: Decimal,
    /// Seconds since the agent's first-ever request that trigger settlement.
    pub time_threshold: u64,
    /// Queued entry count that triggers settlement.
    pub count_threshold: usize,
}

impl Default for SettlementThreshold {
    fn default() -> Self {
        SettlementThreshold {
            amount_threshold: Decimal::new(100, 2), // 1.00
            time_threshold: 3600,
            count_threshold: 100,
        }
    }
}

/// Body of `POST /queue`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueRequest {
    pub authorization_id: String,
}

/// Body of `POST /batch/create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCreateRequest {
    pub agent_address: String,
    #[serde(default)]
    pub merchant_address: Option<String>,
}

/// Body of `POST /batch/complete`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCompleteRequest {
    pub batch_id: String,
    pub transaction_signature: String,
}

/// Body of `POST /batch/fail`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchFailRequest {
    pub batch_id: String,
    pub error: String,
}

/// Body of `POST /dispute`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeRequest {
    pub authorization_id: String,
    pub agent_address: String,
    pub reason: String,
    #[serde(default)]
    pub evidence: Option<serde_json::Value>,
}

/// Body of `POST /dispute/resolve`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeResolveRequest {
    pub dispute_id: String,
    pub resolution: DisputeResolution,
    #[serde(default)]
    pub note: Option<String>,
}

/// Body of `POST /settlement/trigger`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub agent_address: String,
    #[serde(default)]
    pub merchant_address: Option<String>,
}
