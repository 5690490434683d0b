//! The settlement engine.
//!
//! Watches queued authorizations, and when a `(agent, merchant)` group
//! crosses a configured threshold, turns the group into a batch and
//! dispatches it through the [`Signer`]. A periodic scheduler drives both
//! the expiry sweep and automatic settlement; manual triggering is exposed
//! through the API.
//!
//! The dispatch pattern never holds the state lock across the on-chain
//! call: lock → create and snapshot the batch → unlock → transfer → lock →
//! apply the completion or failure transition. An in-flight key set keeps
//! at most one batch outstanding per `(agent, merchant)` pair.

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;

use crate::ledger::LedgerError;
use crate::signer::{Signer, SignerError};
use crate::state::SharedState;
use crate::types::{SettlementBatch, SettlementThreshold};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("Invalid batch amount: {0}")]
    InvalidBatchAmount(String),
}

/// Token and tracker pair controlling a cancellable background task.
pub(crate) struct TaskHandle {
    pub token: CancellationToken,
    pub tracker: TaskTracker,
}

impl TaskHandle {
    pub(crate) async fn cancel_and_wait(self) {
        self.token.cancel();
        self.tracker.wait().await;
    }
}

pub struct SettlementEngine {
    state: SharedState,
    signer: Arc<dyn Signer>,
    thresholds: SettlementThreshold,
    check_interval: Duration,
    usdc_mint: String,
    in_flight: Mutex<HashSet<(String, String)>>,
    scheduler: Mutex<Option<TaskHandle>>,
}

impl SettlementEngine {
    pub fn new(
        state: SharedState,
        signer: Arc<dyn Signer>,
        thresholds: SettlementThreshold,
        check_interval: Duration,
        usdc_mint: String,
    ) -> Self {
        Self {
            state,
            signer,
            thresholds,
            check_interval,
            usdc_mint,
            in_flight: Mutex::new(HashSet::new()),
            scheduler: Mutex::new(None),
        }
    }

    pub fn thresholds(&self) -> &SettlementThreshold {
        &self.thresholds
    }

    /// Settle the agent's queued authorizations for one merchant.
    ///
    /// With no merchant given, the busiest merchant is chosen. Returns
    /// `Ok(None)` when there is nothing to settle or a batch for the pair is
    /// already in flight; on success the completed batch is returned. On
    /// dispatch failure the batch is marked `failed`, members are
    /// compensated, and the error propagates — the scheduler retries on a
    /// later tick while thresholds still fire.
    #[instrument(skip(self), fields(agent = %agent))]
    pub async fn trigger_settlement(
        &self,
        agent: &str,
        merchant: Option<&str>,
    ) -> Result<Option<SettlementBatch>, EngineError> {
        let (batch, key) = {
            let mut state = self.state.lock().await;
            let merchant = match merchant {
                Some(m) => m.to_string(),
                None => match state.ledger.busiest_merchant(agent) {
                    Some(m) => m,
                    None => return Ok(None),
                },
            };
            let key = (agent.to_string(), merchant.clone());
            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(key.clone()) {
                    tracing::debug!(merchant = %merchant, "settlement already in flight for pair");
                    return Ok(None);
                }
            }
            let created = match state.ledger.create_batch(agent, Some(&merchant)) {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    self.in_flight.lock().await.remove(&key);
                    return Ok(None);
                }
                Err(error) => {
                    self.in_flight.lock().await.remove(&key);
                    return Err(error.into());
                }
            };
            if let Err(error) = state.ledger.begin_settlement(&created.id) {
                self.in_flight.lock().await.remove(&key);
                return Err(error.into());
            }
            (created, key)
        };

        let dispatched = self.dispatch(&batch).await;

        let outcome = {
            let mut state = self.state.lock().await;
            match dispatched {
                Ok(signature) => state
                    .ledger
                    .complete_settlement(&batch.id, &signature)
                    .map(Some)
                    .map_err(EngineError::from),
                Err(error) => {
                    if let Err(ledger_error) =
                        state.ledger.fail_settlement(&batch.id, &error.to_string())
                    {
                        tracing::error!(
                            batch = %batch.id,
                            error = %ledger_error,
                            "could not record settlement failure"
                        );
                    }
                    Err(error)
                }
            }
        };
        self.in_flight.lock().await.remove(&key);
        outcome
    }

    async fn dispatch(&self, batch: &SettlementBatch) -> Result<String, EngineError> {
        let total = batch
            .total_decimal()
            .map_err(|_| EngineError::InvalidBatchAmount(batch.total_amount.clone()))?;
        let minor_units = to_minor_units(total)
            .ok_or_else(|| EngineError::InvalidBatchAmount(batch.total_amount.clone()))?;
        let signature = self
            .signer
            .transfer(
                &batch.agent_address,
                &batch.merchant_address,
                minor_units,
                &self.usdc_mint,
            )
            .await?;
        Ok(signature)
    }

    /// One scheduler pass: sweep expired authorizations, then settle every
    /// `(agent, merchant)` group whose thresholds fire.
    pub async fn run_tick(&self) {
        let (expired, due) = {
            let mut state = self.state.lock().await;
            let expired = state.ledger.cleanup_expired();
            let due = state.ledger.due_groups(&self.thresholds);
            (expired, due)
        };
        if expired > 0 {
            tracing::info!(count = expired, "swept expired authorizations");
        }
        for (agent, merchant) in due {
            if let Err(error) = self.trigger_settlement(&agent, Some(&merchant)).await {
                tracing::warn!(%agent, %merchant, %error, "scheduled settlement attempt failed");
            }
        }
    }

    /// Start the periodic scheduler. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let engine = Arc::clone(self);
        let tick_token = token.clone();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(engine.check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                // Work runs outside the select so cancellation lands between
                // ticks, never mid-dispatch.
                engine.run_tick().await;
            }
        });
        tracker.close();
        *scheduler = Some(TaskHandle { token, tracker });
        tracing::info!(interval_ms = self.check_interval.as_millis() as u64, "settlement scheduler started");
    }

    /// Stop the scheduler, waiting for any in-progress tick (including an
    /// outstanding on-chain call) to finish. Idempotent.
    pub async fn stop(&self) {
        let handle = self.scheduler.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel_and_wait().await;
            tracing::info!("settlement scheduler stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.scheduler.lock().await.is_some()
    }
}

fn to_minor_units(total: Decimal) -> Option<u64> {
    (total * Decimal::from(1_000_000u64)).trunc().to_u64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::signature::expected_signature;
    use crate::state::FacilitatorState;
    use crate::timestamp::UnixMillis;
    use crate::types::{Authorization, AuthorizationStatus, BatchStatus};

    struct MockSigner {
        fail: bool,
        calls: AtomicUsize,
        last_amount: AtomicUsize,
    }

    impl MockSigner {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail: false,
                calls: AtomicUsize::new(0),
                last_amount: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                calls: AtomicUsize::new(0),
                last_amount: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Signer for MockSigner {
        async fn transfer(
            &self,
            _sender: &str,
            _recipient: &str,
            amount: u64,
            _mint: &str,
        ) -> Result<String, SignerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_amount.store(amount as usize, Ordering::SeqCst);
            if self.fail {
                Err(SignerError::Rpc("rpc timeout".to_string()))
            } else {
                Ok("tx_abc".to_string())
            }
        }
    }

    fn engine_with(state: SharedState, signer: Arc<dyn Signer>) -> Arc<SettlementEngine> {
        Arc::new(SettlementEngine::new(
            state,
            signer,
            SettlementThreshold::default(),
            Duration::from_millis(10),
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(),
        ))
    }

    async fn seed(state: &SharedState, id: &str, amount: &str) {
        let now = UnixMillis::now();
        let mut auth = Authorization {
            id: id.to_string(),
            agent_address: "agentA".to_string(),
            merchant_address: "merchantM".to_string(),
            tool_name: "search".to_string(),
            amount: amount.to_string(),
            currency: "USDC".to_string(),
            timestamp: now,
            expires_at: now + 600_000,
            nonce: format!("nonce-{id}"),
            signature: String::new(),
            status: AuthorizationStatus::Pending,
            data_hash: None,
        };
        auth.signature = expected_signature(&auth);
        let mut state = state.lock().await;
        state.ledger.verify(auth).unwrap();
        state
            .ledger
            .queue_for_settlement(id, &SettlementThreshold::default())
            .unwrap();
    }

    #[tokio::test]
    async fn trigger_settles_and_converts_minor_units() {
        let state = FacilitatorState::shared();
        seed(&state, "auth_a", "0.6").await;
        seed(&state, "auth_b", "0.5").await;
        let signer = MockSigner::ok();
        let engine = engine_with(state.clone(), signer.clone());

        let batch = engine
            .trigger_settlement("agentA", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.transaction_signature.as_deref(), Some("tx_abc"));
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(signer.last_amount.load(Ordering::SeqCst), 1_100_000);

        let state = state.lock().await;
        assert_eq!(
            state.ledger.get("auth_a").unwrap().status,
            AuthorizationStatus::Settled
        );
        assert_eq!(state.ledger.queue_len(), 0);
    }

    #[tokio::test]
    async fn trigger_with_nothing_queued_is_noop() {
        let state = FacilitatorState::shared();
        let engine = engine_with(state, MockSigner::ok());
        assert!(engine
            .trigger_settlement("agentA", None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn dispatch_failure_fails_batch_and_propagates() {
        let state = FacilitatorState::shared();
        seed(&state, "auth_a", "0.5").await;
        let engine = engine_with(state.clone(), MockSigner::failing());

        let error = engine
            .trigger_settlement("agentA", None)
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::Signer(_)));

        let state_guard = state.lock().await;
        let batch = state_guard.ledger.list_batches(Some("agentA"));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].status, BatchStatus::Failed);
        assert!(batch[0].error.as_deref().unwrap().contains("rpc timeout"));
        // Member stays queued and validated, ready for retry.
        assert!(state_guard.ledger.is_queued("auth_a"));
        assert_eq!(
            state_guard.ledger.get("auth_a").unwrap().status,
            AuthorizationStatus::Validated
        );
        drop(state_guard);

        // In-flight key was released: a retry with a working signer succeeds.
        let retry_engine = engine_with(state.clone(), MockSigner::ok());
        let batch = retry_engine
            .trigger_settlement("agentA", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn in_flight_pair_is_not_double_settled() {
        let state = FacilitatorState::shared();
        seed(&state, "auth_a", "0.5").await;
        let signer = MockSigner::ok();
        let engine = engine_with(state, signer.clone());

        engine.in_flight.lock().await.insert((
            "agentA".to_string(),
            "merchantM".to_string(),
        ));
        let outcome = engine.trigger_settlement("agentA", None).await.unwrap();
        assert!(outcome.is_none());
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scheduler_start_stop_is_idempotent() {
        let state = FacilitatorState::shared();
        let engine = engine_with(state, MockSigner::ok());
        assert!(!engine.is_running().await);
        engine.start().await;
        engine.start().await;
        assert!(engine.is_running().await);
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running().await);
    }

    #[tokio::test]
    async fn scheduler_settles_due_groups() {
        let state = FacilitatorState::shared();
        seed(&state, "auth_a", "0.6").await;
        seed(&state, "auth_b", "0.5").await;
        let engine = engine_with(state.clone(), MockSigner::ok());

        engine.run_tick().await;

        let state = state.lock().await;
        let batches = state.ledger.list_batches(None);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].status, BatchStatus::Completed);
    }

    #[test]
    fn minor_units_truncate() {
        assert_eq!(to_minor_units(Decimal::from_str("1.1").unwrap()), Some(1_100_000));
        assert_eq!(
            to_minor_units(Decimal::from_str("0.0000019").unwrap()),
            Some(1)
        );
        assert_eq!(to_minor_units(Decimal::ZERO), Some(0));
    }
}
