#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Protocol values for FlowPay 402 negotiation.
//!
//! A FlowPay resource server answers unpaid requests with `402 Payment Required`
//! and a set of `x-flowpay-*` headers naming a payment mode (continuous stream
//! or one-shot transfer), a price, and where to pay. A client pays on a ledger
//! and retries with a proof header. This crate holds the I/O-free pieces of
//! that exchange; the negotiation engine lives in the `flowpay` crate.
//!
//! # Modules
//!
//! - [`amount`] - Human decimal amounts and their smallest-unit conversion
//! - [`config`] - `$VAR` / `${VAR}` resolution for configuration values
//! - [`headers`] - Case-insensitive header table and header-name vocabulary
//! - [`proof`] - Stream ids, transaction hashes and retry proof headers
//! - [`requirement`] - Parsing 402 challenges into payment requirements
//! - [`timestamp`] - Second-resolution Unix timestamps

pub mod amount;
pub mod config;
pub mod headers;
pub mod proof;
pub mod requirement;
pub mod timestamp;
