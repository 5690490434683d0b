//! Deferred settlement facilitator for x402-style payments.
//!
//! Agents that consume paid API calls sign one authorization per call
//! instead of paying on-chain per request. This crate accepts those
//! authorizations, accumulates them, and settles them as single on-chain
//! batch transfers grouped per `(agent, merchant)` pair, with dispute
//! handling and usage analytics on top.
//!
//! # Subsystems
//!
//! - [`ledger`] — verifies, stores, and transitions authorizations; owns
//!   per-agent usage accounting and the batch registry.
//! - [`queue`] — the ordered collection of authorization ids awaiting
//!   batching.
//! - [`engine`] — threshold evaluation, batch creation, on-chain dispatch
//!   through a [`signer::Signer`], and the periodic settlement scheduler.
//! - [`dispute`] — the dispute lifecycle, coupled to authorization status.
//! - [`monitoring`] — read-only payment/settlement/dispute metrics, agent
//!   analytics, health, and a bounded snapshot history.
//! - [`handlers`] — the Axum HTTP surface over all of the above.
//! - [`signature`] — the canonical SHA-256 digest an authorization carries.
//! - [`config`] — JSON-file plus environment configuration.
//! - [`telemetry`] — tracing with optional OpenTelemetry OTLP export.
//!
//! All state is in-memory behind one lock (see [`state`]); durability is an
//! embedder concern.

pub mod config;
pub mod dispute;
pub mod engine;
pub mod handlers;
pub mod ledger;
pub mod monitoring;
pub mod queue;
pub mod signature;
pub mod signer;
pub mod state;
pub mod telemetry;
pub mod timestamp;
pub mod types;
