//! The authorization ledger.
//!
//! Owns every [`Authorization`], [`AgentUsage`], and [`SettlementBatch`]
//! record plus the settlement queue, and is the only place authorization
//! status transitions happen. Peer components (the settlement engine, the
//! dispute book, monitoring) act through this API rather than reaching into
//! the containers.
//!
//! All operations are synchronous; the async boundary serializes access
//! behind one lock (see [`crate::state`]).

use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;
use uuid::Uuid;

use crate::queue::SettlementQueue;
use crate::signature;
use crate::timestamp::UnixMillis;
use crate::types::{
    AgentUsage, Authorization, AuthorizationStatus, BatchStatus, SettlementBatch,
    SettlementThreshold,
};

/// Errors returned by ledger operations. The display strings are part of
/// the API contract: clients match on them.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Authorization already exists")]
    DuplicateAuthorization,
    #[error("Authorization expired")]
    AuthorizationExpired,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid amount")]
    InvalidAmount,
    #[error("Authorization not found")]
    AuthorizationNotFound,
    #[error("Already queued")]
    AlreadyQueued,
    #[error("Already settled")]
    AlreadySettled,
    #[error("Authorization disputed")]
    AuthorizationDisputed,
    #[error("Settlement batch not found")]
    BatchNotFound,
    #[error("Settlement batch already finalized")]
    BatchAlreadyFinal,
}

/// Result of queueing an authorization for settlement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOutcome {
    pub should_settle: bool,
    pub reason: Option<String>,
}

/// A `(agent, merchant)` group of queued authorizations, used for threshold
/// evaluation.
#[derive(Debug)]
struct QueuedGroup {
    agent: String,
    merchant: String,
    total: Decimal,
    count: usize,
}

#[derive(Debug, Default)]
pub struct AuthorizationLedger {
    authorizations: HashMap<String, Authorization>,
    usage: HashMap<String, AgentUsage>,
    batches: HashMap<String, SettlementBatch>,
    batch_order: Vec<String>,
    queue: SettlementQueue,
}

impl AuthorizationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify and store an incoming authorization.
    ///
    /// Rejects duplicates, expired authorizations, signature mismatches, and
    /// malformed amounts. On acceptance the record enters `pending` and the
    /// agent's usage accounting is updated.
    pub fn verify(&mut self, mut auth: Authorization) -> Result<(), LedgerError> {
        if self.authorizations.contains_key(&auth.id) {
            return Err(LedgerError::DuplicateAuthorization);
        }
        let now = UnixMillis::now();
        if auth.expires_at < now {
            return Err(LedgerError::AuthorizationExpired);
        }
        if !signature::is_valid(&auth) {
            return Err(LedgerError::InvalidSignature);
        }
        let amount = auth
            .amount_decimal()
            .map_err(|_| LedgerError::InvalidAmount)?;

        auth.status = AuthorizationStatus::Pending;
        let usage = self
            .usage
            .entry(auth.agent_address.clone())
            .or_insert_with(|| AgentUsage {
                authorization_ids: Vec::new(),
                total_amount: Decimal::ZERO,
                request_count: 0,
                first_request_at: now,
                last_request_at: now,
            });
        usage.authorization_ids.push(auth.id.clone());
        usage.total_amount += amount;
        usage.request_count += 1;
        usage.last_request_at = now;

        tracing::debug!(id = %auth.id, agent = %auth.agent_address, amount = %auth.amount, "authorization accepted");
        self.authorizations.insert(auth.id.clone(), auth);
        Ok(())
    }

    /// Queue a verified authorization for settlement, transitioning it
    /// `pending → validated`, and report whether the agent's thresholds now
    /// fire.
    pub fn queue_for_settlement(
        &mut self,
        id: &str,
        thresholds: &SettlementThreshold,
    ) -> Result<QueueOutcome, LedgerError> {
        let auth = self
            .authorizations
            .get_mut(id)
            .ok_or(LedgerError::AuthorizationNotFound)?;
        if self.queue.contains(id) {
            return Err(LedgerError::AlreadyQueued);
        }
        match auth.status {
            AuthorizationStatus::Settled => return Err(LedgerError::AlreadySettled),
            AuthorizationStatus::Expired => return Err(LedgerError::AuthorizationExpired),
            AuthorizationStatus::Disputed => return Err(LedgerError::AuthorizationDisputed),
            AuthorizationStatus::Pending | AuthorizationStatus::Validated => {}
        }
        auth.status = AuthorizationStatus::Validated;
        let agent = auth.agent_address.clone();
        self.queue.push(id);

        let should_settle = self.check_thresholds(&agent, thresholds);
        Ok(QueueOutcome {
            should_settle,
            reason: should_settle.then(|| "Settlement threshold met".to_string()),
        })
    }

    /// Whether any `(agent, merchant)` group of this agent's queued
    /// authorizations crosses a settlement threshold.
    pub fn check_thresholds(&self, agent: &str, thresholds: &SettlementThreshold) -> bool {
        self.queued_groups()
            .iter()
            .filter(|group| group.agent == agent)
            .any(|group| self.group_fires(group, thresholds))
    }

    /// Every `(agent, merchant)` group whose thresholds currently fire, in
    /// queue encounter order. Used by the settlement scheduler.
    pub fn due_groups(&self, thresholds: &SettlementThreshold) -> Vec<(String, String)> {
        self.queued_groups()
            .into_iter()
            .filter(|group| self.group_fires(group, thresholds))
            .map(|group| (group.agent, group.merchant))
            .collect()
    }

    fn group_fires(&self, group: &QueuedGroup, thresholds: &SettlementThreshold) -> bool {
        let meets_amount = group.total >= thresholds.amount_threshold;
        let meets_count = group.count >= thresholds.count_threshold;
        // Time is measured from the agent's first-ever request, not from the
        // earliest queued entry: long-lived agents settle sooner.
        let meets_time = self
            .usage
            .get(&group.agent)
            .map(|usage| UnixMillis::now().secs_since(usage.first_request_at) >= thresholds.time_threshold)
            .unwrap_or(false);
        meets_amount || meets_time || meets_count
    }

    fn queued_groups(&self) -> Vec<QueuedGroup> {
        let mut groups: Vec<QueuedGroup> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        for id in self.queue.iter() {
            let Some(auth) = self.authorizations.get(id) else {
                continue;
            };
            let amount = auth.amount_decimal().unwrap_or(Decimal::ZERO);
            let key = (auth.agent_address.clone(), auth.merchant_address.clone());
            match index.get(&key) {
                Some(&at) => {
                    groups[at].total += amount;
                    groups[at].count += 1;
                }
                None => {
                    index.insert(key, groups.len());
                    groups.push(QueuedGroup {
                        agent: auth.agent_address.clone(),
                        merchant: auth.merchant_address.clone(),
                        total: amount,
                        count: 1,
                    });
                }
            }
        }
        groups
    }

    pub fn get(&self, id: &str) -> Option<&Authorization> {
        self.authorizations.get(id)
    }

    /// Every authorization observed for the agent, in submission order,
    /// optionally filtered by status.
    pub fn list_by_agent(
        &self,
        agent: &str,
        status: Option<AuthorizationStatus>,
    ) -> Vec<Authorization> {
        let Some(usage) = self.usage.get(agent) else {
            return Vec::new();
        };
        usage
            .authorization_ids
            .iter()
            .filter_map(|id| self.authorizations.get(id))
            .filter(|auth| status.is_none_or(|wanted| auth.status == wanted))
            .cloned()
            .collect()
    }

    /// The agent's queued (`validated`) authorizations, in queue order.
    pub fn list_pending(&self, agent: &str) -> Vec<Authorization> {
        self.queue
            .iter()
            .filter_map(|id| self.authorizations.get(id))
            .filter(|auth| {
                auth.agent_address == agent && auth.status == AuthorizationStatus::Validated
            })
            .cloned()
            .collect()
    }

    /// Unique merchant addresses across the agent's queued authorizations,
    /// in queue encounter order.
    pub fn pending_merchants(&self, agent: &str) -> Vec<String> {
        let mut merchants = Vec::new();
        for auth in self.list_pending(agent) {
            if !merchants.contains(&auth.merchant_address) {
                merchants.push(auth.merchant_address);
            }
        }
        merchants
    }

    pub fn usage(&self, agent: &str) -> Option<&AgentUsage> {
        self.usage.get(agent)
    }

    /// Agents with recorded usage, sorted for deterministic enumeration.
    pub fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.usage.keys().cloned().collect();
        agents.sort();
        agents
    }

    /// Attach the hex digest of the fetched payload to an authorization.
    pub fn record_data_hash(&mut self, id: &str, data_hash: &str) -> Result<(), LedgerError> {
        let auth = self
            .authorizations
            .get_mut(id)
            .ok_or(LedgerError::AuthorizationNotFound)?;
        auth.data_hash = Some(data_hash.to_string());
        Ok(())
    }

    /// The merchant with the most queued entries for the agent; ties break
    /// toward the merchant encountered first in queue order.
    pub fn busiest_merchant(&self, agent: &str) -> Option<String> {
        let mut best: Option<(String, usize)> = None;
        for group in self.queued_groups() {
            if group.agent != agent {
                continue;
            }
            match &best {
                Some((_, count)) if *count >= group.count => {}
                _ => best = Some((group.merchant, group.count)),
            }
        }
        best.map(|(merchant, _)| merchant)
    }

    /// Create a settlement batch from the agent's queued authorizations.
    ///
    /// With no merchant given, the busiest merchant is chosen. Members are
    /// restricted to one merchant and to the first member's currency, so a
    /// batch always settles as a single transfer. Returns `None` when
    /// nothing is queued for the pair. Queue membership is untouched until
    /// the batch completes.
    pub fn create_batch(
        &mut self,
        agent: &str,
        merchant: Option<&str>,
    ) -> Result<Option<SettlementBatch>, LedgerError> {
        let merchant = match merchant {
            Some(m) => m.to_string(),
            None => match self.busiest_merchant(agent) {
                Some(m) => m,
                None => return Ok(None),
            },
        };

        let mut members: Vec<Authorization> = Vec::new();
        for id in self.queue.iter() {
            let Some(auth) = self.authorizations.get(id) else {
                continue;
            };
            if auth.agent_address != agent || auth.merchant_address != merchant {
                continue;
            }
            if let Some(first) = members.first()
                && first.currency != auth.currency
            {
                continue;
            }
            members.push(auth.clone());
        }
        if members.is_empty() {
            return Ok(None);
        }

        let mut total = Decimal::ZERO;
        for member in &members {
            total += member
                .amount_decimal()
                .map_err(|_| LedgerError::InvalidAmount)?;
        }
        let mut total = total.round_dp_with_strategy(6, RoundingStrategy::MidpointNearestEven);
        total.rescale(6);

        let batch = SettlementBatch {
            id: format!("batch_{}", Uuid::now_v7()),
            agent_address: agent.to_string(),
            merchant_address: merchant,
            currency: members[0].currency.clone(),
            total_amount: total.to_string(),
            authorizations: members,
            status: BatchStatus::Pending,
            created_at: UnixMillis::now(),
            settled_at: None,
            transaction_signature: None,
            error: None,
        };
        tracing::info!(
            batch = %batch.id,
            agent = %batch.agent_address,
            merchant = %batch.merchant_address,
            total = %batch.total_amount,
            members = batch.authorizations.len(),
            "settlement batch created"
        );
        self.batch_order.push(batch.id.clone());
        self.batches.insert(batch.id.clone(), batch.clone());
        Ok(Some(batch))
    }

    pub fn batch(&self, id: &str) -> Option<&SettlementBatch> {
        self.batches.get(id)
    }

    /// Batches in creation order, optionally filtered by agent.
    pub fn list_batches(&self, agent: Option<&str>) -> Vec<SettlementBatch> {
        self.batch_order
            .iter()
            .filter_map(|id| self.batches.get(id))
            .filter(|batch| agent.is_none_or(|a| batch.agent_address == a))
            .cloned()
            .collect()
    }

    /// Transition a batch `pending → processing` while its on-chain
    /// transfer is outstanding.
    pub fn begin_settlement(&mut self, batch_id: &str) -> Result<(), LedgerError> {
        let batch = self
            .batches
            .get_mut(batch_id)
            .ok_or(LedgerError::BatchNotFound)?;
        match batch.status {
            BatchStatus::Completed | BatchStatus::Failed => Err(LedgerError::BatchAlreadyFinal),
            _ => {
                batch.status = BatchStatus::Processing;
                Ok(())
            }
        }
    }

    /// Mark a batch completed: record the transaction signature, settle
    /// every member, and drop the members from the queue.
    pub fn complete_settlement(
        &mut self,
        batch_id: &str,
        transaction_signature: &str,
    ) -> Result<SettlementBatch, LedgerError> {
        let member_ids: Vec<String> = {
            let batch = self
                .batches
                .get_mut(batch_id)
                .ok_or(LedgerError::BatchNotFound)?;
            match batch.status {
                BatchStatus::Completed | BatchStatus::Failed => {
                    return Err(LedgerError::BatchAlreadyFinal);
                }
                _ => {}
            }
            batch.status = BatchStatus::Completed;
            batch.settled_at = Some(UnixMillis::now());
            batch.transaction_signature = Some(transaction_signature.to_string());
            for member in &mut batch.authorizations {
                member.status = AuthorizationStatus::Settled;
            }
            batch.authorizations.iter().map(|a| a.id.clone()).collect()
        };

        for id in &member_ids {
            self.queue.remove(id);
            if let Some(auth) = self.authorizations.get_mut(id) {
                auth.status = AuthorizationStatus::Settled;
            }
        }
        tracing::info!(batch = %batch_id, tx = %transaction_signature, members = member_ids.len(), "settlement completed");
        Ok(self.batches[batch_id].clone())
    }

    /// Mark a batch failed and compensate its members.
    ///
    /// Queue membership is left as it stands at failure time: a member still
    /// queued returns to `validated` (so the scheduler naturally retries it
    /// on a later tick), a member no longer queued returns to `pending`.
    /// Members that became `disputed`, `settled`, or `expired` in the
    /// meantime are left alone.
    pub fn fail_settlement(
        &mut self,
        batch_id: &str,
        error: &str,
    ) -> Result<SettlementBatch, LedgerError> {
        let member_ids: Vec<String> = {
            let batch = self
                .batches
                .get_mut(batch_id)
                .ok_or(LedgerError::BatchNotFound)?;
            match batch.status {
                BatchStatus::Completed | BatchStatus::Failed => {
                    return Err(LedgerError::BatchAlreadyFinal);
                }
                _ => {}
            }
            batch.status = BatchStatus::Failed;
            batch.error = Some(error.to_string());
            batch.authorizations.iter().map(|a| a.id.clone()).collect()
        };

        let mut reverted: HashMap<String, AuthorizationStatus> = HashMap::new();
        for id in &member_ids {
            let queued = self.queue.contains(id);
            if let Some(auth) = self.authorizations.get_mut(id) {
                match auth.status {
                    AuthorizationStatus::Settled
                    | AuthorizationStatus::Disputed
                    | AuthorizationStatus::Expired => {}
                    _ => {
                        auth.status = if queued {
                            AuthorizationStatus::Validated
                        } else {
                            AuthorizationStatus::Pending
                        };
                    }
                }
                reverted.insert(id.clone(), auth.status);
            }
        }
        if let Some(batch) = self.batches.get_mut(batch_id) {
            for member in &mut batch.authorizations {
                if let Some(status) = reverted.get(&member.id) {
                    member.status = *status;
                }
            }
        }
        tracing::warn!(batch = %batch_id, error = %error, "settlement failed");
        Ok(self.batches[batch_id].clone())
    }

    /// Transition an authorization to `disputed` and pull it out of the
    /// queue. Called by the dispute book only.
    pub fn mark_disputed(&mut self, id: &str) -> Result<(), LedgerError> {
        let auth = self
            .authorizations
            .get_mut(id)
            .ok_or(LedgerError::AuthorizationNotFound)?;
        auth.status = AuthorizationStatus::Disputed;
        self.queue.remove(id);
        Ok(())
    }

    /// Return a disputed authorization to `validated` and re-queue it.
    /// Called by the dispute book when a dispute resolves against the agent.
    pub fn reinstate_disputed(&mut self, id: &str) -> Result<(), LedgerError> {
        let auth = self
            .authorizations
            .get_mut(id)
            .ok_or(LedgerError::AuthorizationNotFound)?;
        if auth.status != AuthorizationStatus::Disputed {
            return Ok(());
        }
        auth.status = AuthorizationStatus::Validated;
        self.queue.push(id);
        Ok(())
    }

    /// Sweep authorizations past their expiry that are still `pending`,
    /// marking them `expired`. Queued (`validated`), settled, and disputed
    /// records are never swept. Returns the number of records expired.
    pub fn cleanup_expired(&mut self) -> usize {
        let now = UnixMillis::now();
        let mut expired = 0;
        let mut drop_from_queue = Vec::new();
        for auth in self.authorizations.values_mut() {
            if auth.status == AuthorizationStatus::Pending && auth.expires_at < now {
                auth.status = AuthorizationStatus::Expired;
                drop_from_queue.push(auth.id.clone());
                expired += 1;
            }
        }
        for id in drop_from_queue {
            self.queue.remove(&id);
        }
        expired
    }

    pub fn authorizations(&self) -> impl Iterator<Item = &Authorization> {
        self.authorizations.values()
    }

    pub fn batches(&self) -> impl Iterator<Item = &SettlementBatch> {
        self.batch_order.iter().filter_map(|id| self.batches.get(id))
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queued(&self, id: &str) -> bool {
        self.queue.contains(id)
    }
}
