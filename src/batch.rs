//! Batch registry: physical lots and their attached certificate ids.

use rusqlite::{params, Connection, OptionalExtension as _, Transaction};
use serde::Serialize;
use tracing::debug;

use crate::entity::resolve_entity;
use crate::error::{ProvcertError, Result, ResultExt as _};
use crate::events::LedgerEvent;
use crate::journal;
use crate::ledger::{
    allocate_id, begin_write, read_counter, sql_id, sql_new_id, Ledger, NEXT_BATCH_ID,
};
use crate::model::{Batch, BatchId, CertificateId, Mode};
use crate::util;

/// Fields of a batch fixed at registration.  The certificate list grows and
/// is covered by the certificates' own record hashes instead.
#[derive(Serialize)]
struct BatchRecord<'a> {
    id: BatchId,
    origin: &'a str,
    custodian: &'a str,
    created_at_utc: &'a str,
}

impl Batch {
    /// Hex SHA-256 of the registration fields, as journaled in `AddBatch`.
    pub fn record_hash(&self) -> Result<String> {
        let record = BatchRecord {
            id: self.id,
            origin: &self.origin,
            custodian: &self.custodian,
            created_at_utc: &self.created_at_utc,
        };
        let json = serde_json::to_vec(&record).ctx_journal("serialize batch record")?;
        Ok(util::sha256_hex(&json))
    }
}

pub(crate) fn load_batch(conn: &Connection, id: BatchId) -> Result<Option<Batch>> {
    let Some(key) = sql_id(id) else {
        return Ok(None);
    };
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT origin, custodian, created_at_utc FROM batches WHERE id=?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((origin, custodian, created_at_utc)) = row else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT certificate_id FROM batch_certificates WHERE batch_id=?1 ORDER BY position ASC",
        )
        .ctx_ledger("prepare select batch certificates")?;
    let certificate_ids = stmt
        .query_map([key], |row| row.get::<_, i64>(0))
        .ctx_ledger("query batch certificates")?
        .map(|r| r.map(|v| v as CertificateId))
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(Batch {
        id,
        origin,
        custodian,
        certificate_ids,
        created_at_utc,
    }))
}

/// Link `certificate_id` into its batch's list.  Only the certificate
/// ledger calls this, inside its issuance transaction, after checking that
/// the batch exists.
pub(crate) fn append_certificate(
    tx: &Transaction<'_>,
    batch_id: BatchId,
    certificate_id: CertificateId,
) -> Result<()> {
    let position: i64 = tx
        .query_row(
            "SELECT COUNT(*) FROM batch_certificates WHERE batch_id=?1",
            [sql_new_id(batch_id)?],
            |row| row.get(0),
        )
        .ctx_ledger("count batch certificates")?;
    tx.execute(
        "INSERT INTO batch_certificates(batch_id, position, certificate_id) VALUES (?1,?2,?3)",
        params![sql_new_id(batch_id)?, position, sql_new_id(certificate_id)?],
    )
    .ctx_ledger("append certificate to batch")?;
    Ok(())
}

impl Ledger {
    /// Register a batch held by `custodian_id`; returns its id.
    pub fn add_batch(&mut self, caller: &str, origin: &str, custodian_id: &str) -> Result<BatchId> {
        self.policy.authorize_admin(caller, "register batches")?;
        util::validate_origin(origin)?;
        if !self.policy.origin_vocabulary.is_empty()
            && !self.policy.origin_vocabulary.iter().any(|o| o == origin)
        {
            return Err(ProvcertError::Validation(format!(
                "origin '{origin}' is not in this deployment's vocabulary"
            )));
        }

        let tx = begin_write(&mut self.conn)?;
        let custodian = resolve_entity(&tx, custodian_id)?;
        if self.policy.require_prover_custodian && custodian.mode != Mode::Prover {
            return Err(ProvcertError::NotProver {
                id: custodian.id,
                mode: custodian.mode,
            });
        }

        let batch = Batch {
            id: allocate_id(&tx, NEXT_BATCH_ID)?,
            origin: origin.to_string(),
            custodian: custodian.id,
            certificate_ids: Vec::new(),
            created_at_utc: util::now_utc_rfc3339(),
        };
        tx.execute(
            "INSERT INTO batches(id, origin, custodian, created_at_utc) VALUES (?1,?2,?3,?4)",
            params![
                sql_new_id(batch.id)?,
                batch.origin,
                batch.custodian,
                batch.created_at_utc
            ],
        )
        .ctx_ledger("insert batch")?;

        let entry = journal::append(
            &tx,
            &LedgerEvent::AddBatch {
                batch_id: batch.id,
                custodian: batch.custodian.clone(),
                record_hash: batch.record_hash()?,
            },
        )?;
        tx.commit().ctx_ledger("commit tx")?;

        debug!(batch_id = batch.id, origin, custodian = %batch.custodian, "batch registered");
        self.publish(&entry);
        Ok(batch.id)
    }

    pub fn get_batch(&self, batch_id: BatchId) -> Result<Batch> {
        load_batch(&self.conn, batch_id)?.ok_or_else(|| ProvcertError::batch_not_found(batch_id))
    }

    /// Number of batches registered so far (also the next batch id).
    pub fn batch_count(&self) -> Result<u64> {
        read_counter(&self.conn, NEXT_BATCH_ID)
    }

    pub fn list_batches(&self) -> Result<Vec<Batch>> {
        (0..self.batch_count()?).map(|id| self.get_batch(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::events::MemorySink;
    use crate::ledger::LedgerPolicy;

    fn ledger_with_parties(policy: LedgerPolicy) -> Ledger {
        let mut l = Ledger::open_in_memory(policy).unwrap();
        l.add_entity("admin", "supplierA", Mode::Prover).unwrap();
        l.add_entity("admin", "supplierB", Mode::Prover).unwrap();
        l.add_entity("admin", "inspector", Mode::Issuer).unwrap();
        l
    }

    #[test]
    fn ids_are_sequential_from_zero() {
        let mut l = ledger_with_parties(LedgerPolicy::default());
        let origins = ["South_Africa", "Australia", "Congo", "Namibia"];
        for (i, origin) in origins.iter().enumerate() {
            let custodian = if i % 2 == 0 { "supplierA" } else { "supplierB" };
            let id = l.add_batch("admin", origin, custodian).unwrap();
            assert_eq!(id, i as u64);
            let batch = l.get_batch(id).unwrap();
            assert_eq!(batch.origin, *origin);
            assert_eq!(batch.custodian, custodian);
            assert!(batch.certificate_ids.is_empty());
        }
        assert_eq!(l.batch_count().unwrap(), 4);
        assert_eq!(l.list_batches().unwrap().len(), 4);
    }

    #[test]
    fn unknown_custodian_rejected_and_counter_untouched() {
        let mut l = ledger_with_parties(LedgerPolicy::default());
        let err = l.add_batch("admin", "Congo", "nobody").unwrap_err();
        assert!(matches!(err, ProvcertError::UnknownEntity(ref id) if id == "nobody"));
        assert_eq!(l.add_batch("admin", "Congo", "supplierA").unwrap(), 0);
    }

    #[test]
    fn custodian_must_be_prover_by_default() {
        let mut l = ledger_with_parties(LedgerPolicy::default());
        let err = l.add_batch("admin", "Congo", "inspector").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Authorization);
        assert_eq!(l.batch_count().unwrap(), 0);
    }

    #[test]
    fn custodian_role_check_can_be_relaxed() {
        let policy = LedgerPolicy {
            require_prover_custodian: false,
            ..LedgerPolicy::default()
        };
        let mut l = ledger_with_parties(policy);
        assert_eq!(l.add_batch("admin", "Congo", "inspector").unwrap(), 0);
    }

    #[test]
    fn origin_vocabulary_enforced() {
        let policy = LedgerPolicy {
            origin_vocabulary: vec!["South_Africa".into(), "Namibia".into()],
            ..LedgerPolicy::default()
        };
        let mut l = ledger_with_parties(policy);
        assert!(l.add_batch("admin", "Namibia", "supplierA").is_ok());
        let err = l.add_batch("admin", "Atlantis", "supplierA").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn empty_origin_rejected() {
        let mut l = ledger_with_parties(LedgerPolicy::default());
        assert!(l.add_batch("admin", "", "supplierA").is_err());
    }

    #[test]
    fn missing_batch_is_not_found() {
        let l = ledger_with_parties(LedgerPolicy::default());
        let err = l.get_batch(0).unwrap_err();
        assert_eq!(err.to_string(), "batch not found: 0");
    }

    #[test]
    fn emits_add_batch_event() {
        let mut l = ledger_with_parties(LedgerPolicy::default());
        let sink = MemorySink::new();
        l.subscribe(Box::new(sink.clone()));
        l.add_batch("admin", "South_Africa", "supplierA").unwrap();
        let batch = l.get_batch(0).unwrap();
        assert_eq!(
            sink.events(),
            vec![LedgerEvent::AddBatch {
                batch_id: 0,
                custodian: "supplierA".into(),
                record_hash: batch.record_hash().unwrap(),
            }]
        );
    }

    #[test]
    fn id_beyond_sqlite_range_is_not_found() {
        let mut l = ledger_with_parties(LedgerPolicy::default());
        l.add_batch("admin", "South_Africa", "supplierA").unwrap();
        for id in [u64::MAX, i64::MAX as u64 + 1] {
            let err = l.get_batch(id).unwrap_err();
            assert_eq!(err.class(), ErrorClass::NotFound);
        }
    }

    #[test]
    fn record_hash_ignores_certificate_list() {
        let mut l = ledger_with_parties(LedgerPolicy::default());
        l.add_batch("admin", "South_Africa", "supplierA").unwrap();
        let mut batch = l.get_batch(0).unwrap();
        let before = batch.record_hash().unwrap();
        batch.certificate_ids.push(7);
        assert_eq!(batch.record_hash().unwrap(), before);
        batch.origin = "Congo".into();
        assert_ne!(batch.record_hash().unwrap(), before);
    }
}
