//! provcert: a provenance-certification ledger for multi-party supply chains.
//!
//! This crate provides:
//! - An entity registry binding participant identities to fixed roles
//! - A batch registry for physical lots and their certificate lists
//! - An append-only certificate ledger recording signed attestations
//! - Signer recovery over stored certificates (secp256k1 ECDSA)
//! - A hash-chained event journal with subscriber delivery
//!
//! State lives in SQLite (SQLCipher-compatible).  The CLI wrapper lives in
//! `src/main.rs`.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod model;

pub mod batch;
pub mod certificate;
pub mod entity;
mod journal;
pub mod ledger;
pub mod signing;
pub mod util;
pub mod verify;

pub use error::{ProvcertError, Result};
pub use ledger::{Ledger, LedgerPolicy};
pub use model::{Batch, BatchId, Certificate, CertificateId, Entity, Mode, Stage, StatusPipeline};
