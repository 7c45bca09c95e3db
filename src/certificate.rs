//! Certificate ledger: immutable, signed attestations about a batch.
//!
//! Issuance records the signature as supplied.  Authenticity is checked
//! separately, by anyone, through [`crate::verify`].

use rusqlite::{params, Connection, OptionalExtension as _};
use tracing::{debug, info};

use crate::batch::{append_certificate, load_batch};
use crate::config::StageOrder;
use crate::entity::resolve_entity;
use crate::error::{ProvcertError, Result, ResultExt as _};
use crate::events::LedgerEvent;
use crate::journal;
use crate::ledger::{
    allocate_id, begin_write, read_counter, sql_id, sql_new_id, Ledger, NEXT_CERTIFICATE_ID,
};
use crate::model::{BatchId, Certificate, CertificateId, Mode, Stage};
use crate::signing;
use crate::util;

/// Upper bound on stored signature size.
pub const MAX_SIGNATURE_LEN: usize = 512;

impl Certificate {
    /// Hash of the canonical attestation message for this certificate's
    /// fields.
    pub fn canonical_hash(&self) -> [u8; 32] {
        signing::attestation_hash(&self.issuer, self.batch_id, &self.prover, &self.status.name)
    }

    /// Hex SHA-256 of the full stored record, as journaled in
    /// `IssueCertificate`.
    pub fn record_hash(&self) -> Result<String> {
        let json = serde_json::to_vec(self).ctx_journal("serialize certificate record")?;
        Ok(util::sha256_hex(&json))
    }
}

pub(crate) fn load_certificate(conn: &Connection, id: CertificateId) -> Result<Option<Certificate>> {
    let Some(key) = sql_id(id) else {
        return Ok(None);
    };
    let cert = conn
        .query_row(
            r#"
            SELECT issuer, prover, status, status_position, batch_id, signature, issued_at_utc
            FROM certificates WHERE id=?1
            "#,
            [key],
            |row| {
                Ok(Certificate {
                    id,
                    issuer: row.get(0)?,
                    prover: row.get(1)?,
                    status: Stage {
                        name: row.get(2)?,
                        position: row.get(3)?,
                    },
                    batch_id: row.get::<_, i64>(4)? as BatchId,
                    signature: row.get(5)?,
                    issued_at_utc: row.get(6)?,
                })
            },
        )
        .optional()?;
    Ok(cert)
}

/// Furthest stage already certified on `batch_id`, if any.
fn furthest_stage(conn: &Connection, batch_id: BatchId) -> Result<Option<Stage>> {
    let stage = conn
        .query_row(
            r#"
            SELECT status, status_position FROM certificates
            WHERE batch_id=?1
            ORDER BY status_position DESC
            LIMIT 1
            "#,
            [sql_new_id(batch_id)?],
            |row| {
                Ok(Stage {
                    name: row.get(0)?,
                    position: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(stage)
}

impl Ledger {
    /// Record that `issuer_id` attests `status` for `prover_id`'s handling
    /// of `batch_id`.  The record, the batch link and the event commit
    /// together or not at all.
    pub fn issue_certificate(
        &mut self,
        caller: &str,
        issuer_id: &str,
        prover_id: &str,
        status: &str,
        batch_id: BatchId,
        signature: &[u8],
    ) -> Result<CertificateId> {
        self.policy.authorize_issuance(caller, issuer_id)?;
        if signature.is_empty() || signature.len() > MAX_SIGNATURE_LEN {
            return Err(ProvcertError::Validation(format!(
                "signature must be 1-{MAX_SIGNATURE_LEN} bytes, got {}",
                signature.len()
            )));
        }

        let tx = begin_write(&mut self.conn)?;

        let issuer = resolve_entity(&tx, issuer_id)?;
        if issuer.mode != Mode::Issuer {
            return Err(ProvcertError::NotIssuer {
                id: issuer.id,
                mode: issuer.mode,
            });
        }
        let prover = resolve_entity(&tx, prover_id)?;
        if load_batch(&tx, batch_id)?.is_none() {
            return Err(ProvcertError::UnknownBatch(batch_id));
        }
        let stage = self.policy.pipeline.resolve(status)?;

        if self.policy.stage_order == StageOrder::Monotonic {
            if let Some(reached) = furthest_stage(&tx, batch_id)? {
                if stage.position < reached.position {
                    return Err(ProvcertError::StageRegression {
                        batch_id,
                        requested: stage.name,
                        reached: reached.name,
                    });
                }
            }
        }

        let cert = Certificate {
            id: allocate_id(&tx, NEXT_CERTIFICATE_ID)?,
            issuer: issuer.id,
            prover: prover.id,
            status: stage,
            batch_id,
            signature: signature.to_vec(),
            issued_at_utc: util::now_utc_rfc3339(),
        };
        tx.execute(
            r#"
            INSERT INTO certificates(
              id, issuer, prover, status, status_position, batch_id, signature, issued_at_utc
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
            "#,
            params![
                sql_new_id(cert.id)?,
                cert.issuer,
                cert.prover,
                cert.status.name,
                cert.status.position,
                sql_new_id(cert.batch_id)?,
                cert.signature,
                cert.issued_at_utc,
            ],
        )
        .ctx_ledger("insert certificate")?;
        append_certificate(&tx, batch_id, cert.id)?;

        let entry = journal::append(
            &tx,
            &LedgerEvent::IssueCertificate {
                issuer: cert.issuer.clone(),
                prover: cert.prover.clone(),
                certificate_id: cert.id,
                record_hash: cert.record_hash()?,
            },
        )?;
        tx.commit().ctx_ledger("commit tx")?;

        info!(
            certificate_id = cert.id,
            batch_id,
            issuer = %cert.issuer,
            prover = %cert.prover,
            status = %cert.status.name,
            "certificate issued"
        );
        self.publish(&entry);
        Ok(cert.id)
    }

    pub fn get_certificate(&self, certificate_id: CertificateId) -> Result<Certificate> {
        load_certificate(&self.conn, certificate_id)?
            .ok_or_else(|| ProvcertError::certificate_not_found(certificate_id))
    }

    /// Number of certificates issued so far (also the next certificate id).
    pub fn certificate_count(&self) -> Result<u64> {
        read_counter(&self.conn, NEXT_CERTIFICATE_ID)
    }

    pub fn list_certificates(&self) -> Result<Vec<Certificate>> {
        (0..self.certificate_count()?)
            .map(|id| self.get_certificate(id))
            .collect()
    }

    /// Certificates attached to `batch_id`, in issuance order.
    pub fn certificates_for_batch(&self, batch_id: BatchId) -> Result<Vec<Certificate>> {
        let batch = self.get_batch(batch_id)?;
        debug!(batch_id, count = batch.certificate_ids.len(), "loading batch certificates");
        batch
            .certificate_ids
            .into_iter()
            .map(|id| self.get_certificate(id))
            .collect()
    }
}
