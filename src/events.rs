//! Domain events and subscribers.
//!
//! Every committed mutation produces exactly one [`LedgerEvent`], recorded in
//! the hash-chained journal (see [`crate::journal`]) inside the same
//! transaction and then handed to each registered [`EventSink`].

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::model::{BatchId, CertificateId, Mode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LedgerEvent {
    AddEntity {
        entity_id: String,
        entity_mode: Mode,
    },
    /// `record_hash` is [`crate::model::Batch::record_hash`] at registration.
    AddBatch {
        batch_id: BatchId,
        custodian: String,
        record_hash: String,
    },
    /// `record_hash` is [`crate::model::Certificate::record_hash`] at issuance.
    IssueCertificate {
        issuer: String,
        prover: String,
        certificate_id: CertificateId,
        record_hash: String,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddEntity { .. } => "AddEntity",
            Self::AddBatch { .. } => "AddBatch",
            Self::IssueCertificate { .. } => "IssueCertificate",
        }
    }
}

/// A journaled event with its position in the hash chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: i64,
    pub ts_utc: String,
    pub event: LedgerEvent,
    pub payload_hash_hex: String,
    pub prev_hash_hex: String,
    pub entry_hash_hex: String,
}

/// Receives events after their transaction commits.
pub trait EventSink: Send {
    fn deliver(&mut self, entry: &JournalEntry);
}

/// Collects delivered entries in memory.  Clones share the same buffer, so a
/// test or an indexer can keep one handle and give the other to the ledger.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.entries().into_iter().map(|e| e.event).collect()
    }
}

impl EventSink for MemorySink {
    fn deliver(&mut self, entry: &JournalEntry) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry.clone()),
            Err(poisoned) => poisoned.into_inner().push(entry.clone()),
        }
    }
}
