#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! HTTP 402 payment negotiation for autonomous agents.
//!
//! A server that charges for a resource answers `402 Payment Required` with
//! headers naming a price, a recipient and a payment mode. This crate turns
//! that challenge into a payment and retries the request with proof, so an
//! agent can consume metered APIs without a human in the loop.
//!
//! # Overview
//!
//! [`engine::NegotiationEngine::fetch`] is the entry point. Per request it:
//!
//! 1. presents a cached payment stream for the host, if one is healthy,
//! 2. on a payable 402, picks streaming or direct payment ([`selector`]),
//! 3. reserves budget and pays through a [`ledger::PaymentLedger`] ([`executor`]),
//! 4. resends with the stream id or transaction hash as proof.
//!
//! All mutable state lives in an [`session::AgentSession`] owned by the
//! caller: the stream cache, spend limits, the emergency stop and counters.
//!
//! # Modules
//!
//! - [`cache`] - Per-host cache of open payment streams with expiry and low-balance eviction.
//! - [`clock`] - Injectable time source.
//! - [`config`] - JSON configuration with environment fallbacks.
//! - [`engine`] - The request, 402, pay, retry loop.
//! - [`error`] - Failure taxonomy for payments and fetches.
//! - [`executor`] - Ledger writes: opening, paying, cancelling.
//! - [`ledger`] - The ledger capability and an in-memory simulation.
//! - [`oracle`] - Decision oracle capability and a Gemini-backed implementation.
//! - [`run`] - Batch runner used by the `flowpay` binary.
//! - [`selector`] - Streaming versus direct payment choice.
//! - [`session`] - Per-agent state and metrics.
//! - [`spending`] - Budget limits and suspicious-activity detection.
//! - [`transport`] - HTTP transport abstraction and its `reqwest` adapter.
//! - [`util`] - Log setup and signal handling.
//!
//! Protocol values (amounts, headers, requirements, proofs) live in the
//! `flowpay-types` crate.

pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod oracle;
pub mod run;
pub mod selector;
pub mod session;
pub mod spending;
pub mod transport;
pub mod util;
