//! Operational monitoring: read-only projections over the facilitator core.
//!
//! Metrics are computed on demand from a snapshot of the shared state and
//! never mutate it. A bounded ring of periodic snapshots provides a cheap
//! history without external storage.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::engine::{SettlementEngine, TaskHandle};
use crate::state::{FacilitatorState, SharedState};
use crate::timestamp::UnixMillis;
use crate::types::{AuthorizationStatus, BatchStatus, DisputeStatus};

/// Maximum number of snapshots retained in the history ring.
pub const HISTORY_CAPACITY: usize = 1000;

/// Queue backlog above which the system reports degraded health.
const BACKLOG_LIMIT: usize = 1000;

/// Authorization counts and volume.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMetrics {
    pub total_authorizations: usize,
    pub pending: usize,
    pub validated: usize,
    pub settled: usize,
    pub disputed: usize,
    pub expired: usize,
    pub total_volume: Decimal,
    pub average_amount: Decimal,
    /// Authorizations per hour of uptime.
    pub authorization_rate: f64,
}

/// Batch counts and settlement throughput.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementMetrics {
    pub total_batches: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_settled: Decimal,
    pub average_batch_size: f64,
    pub average_batch_amount: Decimal,
    /// Completed batches per hour of uptime.
    pub settlement_rate: f64,
    /// Mean seconds from batch creation to settlement, over completed
    /// batches.
    pub average_settlement_time: f64,
}

/// Dispute counts and resolution outcomes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisputeMetrics {
    pub total_disputes: usize,
    pub pending: usize,
    pub investigating: usize,
    pub resolved: usize,
    pub rejected: usize,
    /// Resolved disputes whose authorization is still disputed: the agent
    /// won.
    pub approved_disputes: usize,
    pub rejected_disputes: usize,
    /// Disputes per hundred authorizations.
    pub dispute_rate: f64,
    /// Mean seconds from dispute creation to resolution.
    pub average_resolution_time: f64,
}

/// Per-agent settlement reliability projection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAnalytics {
    pub agent_address: String,
    pub total_authorizations: u64,
    pub total_amount: Decimal,
    pub settled_count: usize,
    pub dispute_count: usize,
    pub dispute_rate: f64,
    pub first_seen: UnixMillis,
    pub last_seen: UnixMillis,
    /// 0–100: settled rate minus twice the dispute rate, clamped.
    pub reputation_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    /// Seconds since startup.
    pub uptime: u64,
    pub queue_backlog: usize,
    pub auto_settlement_running: bool,
    /// Rough seconds until the backlog drains; zero when the scheduler is
    /// stopped.
    pub processing_delay: u64,
    pub issues: Vec<String>,
}

/// One entry of the bounded metrics history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub timestamp: UnixMillis,
    pub payments: PaymentMetrics,
    pub settlements: SettlementMetrics,
    pub disputes: DisputeMetrics,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub generated_at: UnixMillis,
    pub payments: PaymentMetrics,
    pub settlements: SettlementMetrics,
    pub disputes: DisputeMetrics,
    pub health: SystemHealth,
    pub history_size: usize,
}

pub struct Monitoring {
    state: SharedState,
    engine: Arc<SettlementEngine>,
    auto_settlement: bool,
    snapshot_interval: Duration,
    started_at: UnixMillis,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    snapshots: Mutex<Option<TaskHandle>>,
}

impl Monitoring {
    pub fn new(
        state: SharedState,
        engine: Arc<SettlementEngine>,
        auto_settlement: bool,
        snapshot_interval: Duration,
    ) -> Self {
        Self {
            state,
            engine,
            auto_settlement,
            snapshot_interval,
            started_at: UnixMillis::now(),
            history: Mutex::new(VecDeque::new()),
            snapshots: Mutex::new(None),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        UnixMillis::now().secs_since(self.started_at)
    }

    /// Hours of uptime, floored at one second to keep rates finite right
    /// after startup.
    fn uptime_hours(&self) -> f64 {
        let millis = UnixMillis::now().millis_since(self.started_at).max(1000);
        millis as f64 / 3_600_000.0
    }

    pub async fn payment_metrics(&self) -> PaymentMetrics {
        let state = self.state.lock().await;
        self.payments_of(&state)
    }

    pub async fn settlement_metrics(&self) -> SettlementMetrics {
        let state = self.state.lock().await;
        self.settlements_of(&state)
    }

    pub async fn dispute_metrics(&self) -> DisputeMetrics {
        let state = self.state.lock().await;
        self.disputes_of(&state)
    }

    pub async fn agent_analytics(&self, agent: &str) -> Option<AgentAnalytics> {
        let state = self.state.lock().await;
        agent_of(&state, agent)
    }

    pub async fn all_agent_analytics(&self) -> Vec<AgentAnalytics> {
        let state = self.state.lock().await;
        state
            .ledger
            .agents()
            .iter()
            .filter_map(|agent| agent_of(&state, agent))
            .collect()
    }

    pub async fn system_health(&self) -> SystemHealth {
        let running = self.engine.is_running().await;
        let state = self.state.lock().await;
        self.health_of(&state, running)
    }

    pub async fn dashboard(&self) -> Dashboard {
        let running = self.engine.is_running().await;
        let history_size = self.history.lock().await.len();
        let state = self.state.lock().await;
        Dashboard {
            generated_at: UnixMillis::now(),
            payments: self.payments_of(&state),
            settlements: self.settlements_of(&state),
            disputes: self.disputes_of(&state),
            health: self.health_of(&state, running),
            history_size,
        }
    }

    pub async fn history(&self) -> Vec<MetricsSnapshot> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Record one snapshot into the history ring, evicting the oldest entry
    /// at capacity.
    pub async fn record_snapshot(&self) {
        let snapshot = {
            let state = self.state.lock().await;
            MetricsSnapshot {
                timestamp: UnixMillis::now(),
                payments: self.payments_of(&state),
                settlements: self.settlements_of(&state),
                disputes: self.disputes_of(&state),
            }
        };
        let mut history = self.history.lock().await;
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(snapshot);
    }

    /// Start the periodic snapshot task. Idempotent.
    pub async fn start_snapshots(self: &Arc<Self>) {
        let mut snapshots = self.snapshots.lock().await;
        if snapshots.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let monitoring = Arc::clone(self);
        let tick_token = token.clone();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(monitoring.snapshot_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                monitoring.record_snapshot().await;
            }
        });
        tracker.close();
        *snapshots = Some(TaskHandle { token, tracker });
        tracing::info!(
            interval_s = self.snapshot_interval.as_secs(),
            "metrics snapshot task started"
        );
    }

    /// Stop the snapshot task. Idempotent.
    pub async fn stop_snapshots(&self) {
        let handle = self.snapshots.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel_and_wait().await;
        }
    }

    fn payments_of(&self, state: &FacilitatorState) -> PaymentMetrics {
        let mut metrics = PaymentMetrics {
            total_authorizations: 0,
            pending: 0,
            validated: 0,
            settled: 0,
            disputed: 0,
            expired: 0,
            total_volume: Decimal::ZERO,
            average_amount: Decimal::ZERO,
            authorization_rate: 0.0,
        };
        for auth in state.ledger.authorizations() {
            metrics.total_authorizations += 1;
            match auth.status {
                AuthorizationStatus::Pending => metrics.pending += 1,
                AuthorizationStatus::Validated => metrics.validated += 1,
                AuthorizationStatus::Settled => metrics.settled += 1,
                AuthorizationStatus::Disputed => metrics.disputed += 1,
                AuthorizationStatus::Expired => metrics.expired += 1,
            }
            metrics.total_volume += auth.amount_decimal().unwrap_or(Decimal::ZERO);
        }
        if metrics.total_authorizations > 0 {
            metrics.average_amount =
                metrics.total_volume / Decimal::from(metrics.total_authorizations);
        }
        metrics.authorization_rate = metrics.total_authorizations as f64 / self.uptime_hours();
        metrics
    }

    fn settlements_of(&self, state: &FacilitatorState) -> SettlementMetrics {
        let mut metrics = SettlementMetrics {
            total_batches: 0,
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
            total_settled: Decimal::ZERO,
            average_batch_size: 0.0,
            average_batch_amount: Decimal::ZERO,
            settlement_rate: 0.0,
            average_settlement_time: 0.0,
        };
        let mut settled_members = 0usize;
        let mut settlement_millis = 0u64;
        for batch in state.ledger.batches() {
            metrics.total_batches += 1;
            match batch.status {
                BatchStatus::Pending => metrics.pending += 1,
                BatchStatus::Processing => metrics.processing += 1,
                BatchStatus::Completed => metrics.completed += 1,
                BatchStatus::Failed => metrics.failed += 1,
            }
            if batch.status == BatchStatus::Completed {
                metrics.total_settled += batch.total_decimal().unwrap_or(Decimal::ZERO);
                settled_members += batch.authorizations.len();
                if let Some(settled_at) = batch.settled_at {
                    settlement_millis += settled_at.millis_since(batch.created_at);
                }
            }
        }
        if metrics.completed > 0 {
            metrics.average_batch_size = settled_members as f64 / metrics.completed as f64;
            metrics.average_batch_amount =
                metrics.total_settled / Decimal::from(metrics.completed);
            metrics.average_settlement_time =
                settlement_millis as f64 / metrics.completed as f64 / 1000.0;
        }
        metrics.settlement_rate = metrics.completed as f64 / self.uptime_hours();
        metrics
    }

    fn disputes_of(&self, state: &FacilitatorState) -> DisputeMetrics {
        let mut metrics = DisputeMetrics {
            total_disputes: 0,
            pending: 0,
            investigating: 0,
            resolved: 0,
            rejected: 0,
            approved_disputes: 0,
            rejected_disputes: 0,
            dispute_rate: 0.0,
            average_resolution_time: 0.0,
        };
        let mut resolution_millis = 0u64;
        for record in state.disputes.iter() {
            metrics.total_disputes += 1;
            match record.status {
                DisputeStatus::Pending => metrics.pending += 1,
                DisputeStatus::Investigating => metrics.investigating += 1,
                DisputeStatus::Resolved => metrics.resolved += 1,
                DisputeStatus::Rejected => metrics.rejected += 1,
            }
            if record.status == DisputeStatus::Resolved {
                let still_disputed = state
                    .ledger
                    .get(&record.authorization_id)
                    .map(|auth| auth.status == AuthorizationStatus::Disputed)
                    .unwrap_or(false);
                if still_disputed {
                    metrics.approved_disputes += 1;
                }
                if let Some(resolved_at) = record.resolved_at {
                    resolution_millis += resolved_at.millis_since(record.created_at);
                }
            }
        }
        metrics.rejected_disputes = metrics.resolved - metrics.approved_disputes;
        let total_authorizations = state.ledger.authorizations().count();
        if total_authorizations > 0 {
            metrics.dispute_rate =
                metrics.total_disputes as f64 / total_authorizations as f64 * 100.0;
        }
        if metrics.resolved > 0 {
            metrics.average_resolution_time =
                resolution_millis as f64 / metrics.resolved as f64 / 1000.0;
        }
        metrics
    }

    fn health_of(&self, state: &FacilitatorState, scheduler_running: bool) -> SystemHealth {
        let queue_backlog = state.ledger.queue_len();
        let mut completed = 0usize;
        let mut failed = 0usize;
        for batch in state.ledger.batches() {
            match batch.status {
                BatchStatus::Completed => completed += 1,
                BatchStatus::Failed => failed += 1,
                _ => {}
            }
        }

        let mut issues = Vec::new();
        if self.auto_settlement && !scheduler_running {
            issues.push(
                "Automatic settlement is enabled but the scheduler is not running".to_string(),
            );
        }
        if failed > 0 && (completed == 0 || failed as f64 / completed as f64 > 0.1) {
            issues.push("Settlement failure ratio exceeds 10%".to_string());
        }
        if queue_backlog > BACKLOG_LIMIT {
            issues.push(format!(
                "Settlement queue backlog of {queue_backlog} exceeds {BACKLOG_LIMIT}"
            ));
        }

        let status = if issues.len() > 3 {
            HealthStatus::Down
        } else if !issues.is_empty() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        SystemHealth {
            status,
            uptime: self.uptime_seconds(),
            queue_backlog,
            auto_settlement_running: scheduler_running,
            processing_delay: if scheduler_running {
                2 * queue_backlog as u64
            } else {
                0
            },
            issues,
        }
    }
}

fn agent_of(state: &FacilitatorState, agent: &str) -> Option<AgentAnalytics> {
    let usage = state.ledger.usage(agent)?;
    let settled_count = usage
        .authorization_ids
        .iter()
        .filter_map(|id| state.ledger.get(id))
        .filter(|auth| auth.status == AuthorizationStatus::Settled)
        .count();
    let dispute_count = state
        .disputes
        .iter()
        .filter(|record| record.agent_address == agent)
        .count();

    let total = usage.request_count as f64;
    let settled_rate = if total > 0.0 {
        settled_count as f64 / total * 100.0
    } else {
        100.0
    };
    let dispute_rate = if total > 0.0 {
        dispute_count as f64 / total * 100.0
    } else {
        0.0
    };
    let reputation_score = (settled_rate - 2.0 * dispute_rate).clamp(0.0, 100.0);

    Some(AgentAnalytics {
        agent_address: agent.to_string(),
        total_authorizations: usage.request_count,
        total_amount: usage.total_amount,
        settled_count,
        dispute_count,
        dispute_rate,
        first_seen: usage.first_request_at,
        last_seen: usage.last_request_at,
        reputation_score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::signature::expected_signature;
    use crate::signer::{Signer, SignerError};
    use crate::types::{
        Authorization, DisputeRequest, DisputeResolution, SettlementThreshold,
    };

    struct StubSigner;

    #[async_trait]
    impl Signer for StubSigner {
        async fn transfer(
            &self,
            _sender: &str,
            _recipient: &str,
            _amount: u64,
            _mint: &str,
        ) -> Result<String, SignerError> {
            Ok("tx_abc".to_string())
        }
    }

    fn monitoring_over(state: SharedState, auto: bool) -> Arc<Monitoring> {
        let engine = Arc::new(SettlementEngine::new(
            state.clone(),
            Arc::new(StubSigner),
            SettlementThreshold::default(),
            Duration::from_secs(60),
            "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(),
        ));
        Arc::new(Monitoring::new(
            state,
            engine,
            auto,
            Duration::from_secs(300),
        ))
    }

    async fn seed(state: &SharedState, id: &str, amount: &str, queue: bool) {
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
        if queue {
            state
                .ledger
                .queue_for_settlement(id, &SettlementThreshold::default())
                .unwrap();
        }
    }

    #[tokio::test]
    async fn payment_metrics_count_by_status() {
        let state = FacilitatorState::shared();
        seed(&state, "auth_a", "0.4", false).await;
        seed(&state, "auth_b", "0.6", true).await;
        let monitoring = monitoring_over(state, false);

        let metrics = monitoring.payment_metrics().await;
        assert_eq!(metrics.total_authorizations, 2);
        assert_eq!(metrics.pending, 1);
        assert_eq!(metrics.validated, 1);
        assert_eq!(metrics.total_volume, Decimal::ONE);
        assert_eq!(metrics.average_amount, Decimal::new(5, 1));
        assert!(metrics.authorization_rate > 0.0);
    }

    #[tokio::test]
    async fn settlement_metrics_cover_completed_batches() {
        let state = FacilitatorState::shared();
        seed(&state, "auth_a", "0.6", true).await;
        seed(&state, "auth_b", "0.5", true).await;
        {
            let mut guard = state.lock().await;
            let batch = guard.ledger.create_batch("agentA", None).unwrap().unwrap();
            guard.ledger.complete_settlement(&batch.id, "tx_abc").unwrap();
        }
        let monitoring = monitoring_over(state, false);

        let metrics = monitoring.settlement_metrics().await;
        assert_eq!(metrics.total_batches, 1);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.total_settled.to_string(), "1.100000");
        assert_eq!(metrics.average_batch_size, 2.0);
        assert!(metrics.settlement_rate > 0.0);
    }

    #[tokio::test]
    async fn dispute_metrics_split_approved_and_rejected() {
        let state = FacilitatorState::shared();
        seed(&state, "auth_a", "0.1", true).await;
        seed(&state, "auth_b", "0.1", true).await;
        {
            let mut guard = state.lock().await;
            let guard = &mut *guard;
            for id in ["auth_a", "auth_b"] {
                guard
                    .disputes
                    .create(
                        &mut guard.ledger,
                        DisputeRequest {
                            authorization_id: id.to_string(),
                            agent_address: "agentA".to_string(),
                            reason: "Data quality issue".to_string(),
                            evidence: None,
                        },
                    )
                    .unwrap();
            }
            let records = guard.disputes.list(None);
            guard
                .disputes
                .resolve(
                    &mut guard.ledger,
                    &records[0].id,
                    DisputeResolution::Approved,
                    None,
                )
                .unwrap();
            guard
                .disputes
                .resolve(
                    &mut guard.ledger,
                    &records[1].id,
                    DisputeResolution::Rejected,
                    None,
                )
                .unwrap();
        }
        let monitoring = monitoring_over(state, false);

        let metrics = monitoring.dispute_metrics().await;
        assert_eq!(metrics.total_disputes, 2);
        assert_eq!(metrics.resolved, 2);
        assert_eq!(metrics.approved_disputes, 1);
        assert_eq!(metrics.rejected_disputes, 1);
        assert_eq!(metrics.dispute_rate, 100.0);
    }

    #[tokio::test]
    async fn reputation_score_penalizes_disputes() {
        let state = FacilitatorState::shared();
        for i in 0..4 {
            seed(&state, &format!("auth_{i}"), "0.5", true).await;
        }
        {
            let mut guard = state.lock().await;
            let guard = &mut *guard;
            // Settle two of four.
            let batch = guard
                .ledger
                .create_batch("agentA", Some("merchantM"))
                .unwrap()
                .unwrap();
            // All four share the merchant, so the batch holds all four;
            // dispute one first instead to split outcomes.
            guard.ledger.fail_settlement(&batch.id, "setup").unwrap();
            guard
                .disputes
                .create(
                    &mut guard.ledger,
                    DisputeRequest {
                        authorization_id: "auth_3".to_string(),
                        agent_address: "agentA".to_string(),
                        reason: "bad data".to_string(),
                        evidence: None,
                    },
                )
                .unwrap();
            let batch = guard
                .ledger
                .create_batch("agentA", Some("merchantM"))
                .unwrap()
                .unwrap();
            assert_eq!(batch.authorizations.len(), 3);
            guard.ledger.complete_settlement(&batch.id, "tx_abc").unwrap();
        }
        let monitoring = monitoring_over(state, false);

        let analytics = monitoring.agent_analytics("agentA").await.unwrap();
        assert_eq!(analytics.total_authorizations, 4);
        assert_eq!(analytics.settled_count, 3);
        assert_eq!(analytics.dispute_count, 1);
        // settled 75% minus 2 * 25% dispute rate.
        assert_eq!(analytics.reputation_score, 25.0);

        assert!(monitoring.agent_analytics("agentB").await.is_none());
        assert_eq!(monitoring.all_agent_analytics().await.len(), 1);
    }

    #[tokio::test]
    async fn health_degrades_when_scheduler_stopped_under_auto() {
        let state = FacilitatorState::shared();
        let monitoring = monitoring_over(state.clone(), true);

        let health = monitoring.system_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.auto_settlement_running);
        assert_eq!(health.processing_delay, 0);
        assert_eq!(health.issues.len(), 1);

        let calm = monitoring_over(state, false);
        let health = calm.system_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.issues.is_empty());
    }

    #[tokio::test]
    async fn health_flags_failure_ratio() {
        let state = FacilitatorState::shared();
        seed(&state, "auth_a", "0.5", true).await;
        {
            let mut guard = state.lock().await;
            let batch = guard.ledger.create_batch("agentA", None).unwrap().unwrap();
            guard.ledger.fail_settlement(&batch.id, "boom").unwrap();
        }
        let monitoring = monitoring_over(state, false);

        let health = monitoring.system_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health
            .issues
            .iter()
            .any(|issue| issue.contains("failure ratio")));
    }

    #[tokio::test]
    async fn history_ring_is_bounded() {
        let state = FacilitatorState::shared();
        let monitoring = monitoring_over(state, false);
        for _ in 0..(HISTORY_CAPACITY + 5) {
            monitoring.record_snapshot().await;
        }
        assert_eq!(monitoring.history().await.len(), HISTORY_CAPACITY);
    }

    #[tokio::test]
    async fn snapshot_task_starts_and_stops() {
        let state = FacilitatorState::shared();
        let monitoring = monitoring_over(state, false);
        monitoring.start_snapshots().await;
        monitoring.start_snapshots().await;
        monitoring.stop_snapshots().await;
        monitoring.stop_snapshots().await;
    }
}
