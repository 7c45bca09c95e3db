//! Tamper-evident, hash-chained, append-only event journal.
//!
//! `entry_hash = SHA-256(prev_hash || payload_hash || kind || seq_be64 || ts_utc)`
//! where `payload_hash` is the SHA-256 of the event's JSON and the first
//! entry chains from 32 zero bytes.  Batch and certificate events carry a
//! hash of the record they created, so verification also catches rewritten
//! rows.

use rusqlite::{params, Connection, OptionalExtension as _};

use crate::batch::load_batch;
use crate::certificate::load_certificate;
use crate::entity::load_entity;
use crate::error::{ProvcertError, Result, ResultExt as _};
use crate::events::{JournalEntry, LedgerEvent};
use crate::util;

fn entry_hash(prev_hash: &[u8], payload_hash: &[u8], kind: &str, seq: i64, ts_utc: &str) -> [u8; 32] {
    let mut preimage = Vec::with_capacity(32 + 32 + kind.len() + 8 + ts_utc.len());
    preimage.extend_from_slice(prev_hash);
    preimage.extend_from_slice(payload_hash);
    preimage.extend_from_slice(kind.as_bytes());
    preimage.extend_from_slice(&seq.to_be_bytes());
    preimage.extend_from_slice(ts_utc.as_bytes());
    util::sha256(&preimage)
}

/// Append `event` to the journal.  Must run inside the transaction that
/// performs the corresponding state change.
pub(crate) fn append(conn: &Connection, event: &LedgerEvent) -> Result<JournalEntry> {
    let (last_seq, last_hash): (i64, Vec<u8>) = conn
        .query_row(
            "SELECT seq, entry_hash FROM events ORDER BY seq DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .unwrap_or((0, vec![0u8; 32]));

    let seq = last_seq + 1;
    let ts_utc = util::now_utc_rfc3339();
    let payload_json = serde_json::to_string(event).ctx_journal("serialize event")?;
    let payload_hash = util::sha256(payload_json.as_bytes());
    let hash = entry_hash(&last_hash, &payload_hash, event.kind(), seq, &ts_utc);

    conn.execute(
        r#"
        INSERT INTO events(seq, ts_utc, kind, payload_json, payload_hash, prev_hash, entry_hash)
        VALUES (?1,?2,?3,?4,?5,?6,?7)
        "#,
        params![
            seq,
            ts_utc,
            event.kind(),
            payload_json,
            payload_hash.to_vec(),
            last_hash,
            hash.to_vec(),
        ],
    )
    .ctx_journal("insert event")?;

    Ok(JournalEntry {
        seq,
        ts_utc,
        event: event.clone(),
        payload_hash_hex: hex::encode(payload_hash),
        prev_hash_hex: hex::encode(&last_hash),
        entry_hash_hex: hex::encode(hash),
    })
}

struct RawEntry {
    seq: i64,
    ts_utc: String,
    kind: String,
    payload_json: String,
    payload_hash: Vec<u8>,
    prev_hash: Vec<u8>,
    entry_hash: Vec<u8>,
}

fn raw_entries(conn: &Connection, after_seq: i64) -> Result<Vec<RawEntry>> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT seq, ts_utc, kind, payload_json, payload_hash, prev_hash, entry_hash
            FROM events
            WHERE seq > ?1
            ORDER BY seq ASC
            "#,
        )
        .ctx_journal("prepare select events")?;
    let rows = stmt
        .query_map([after_seq], |row| {
            Ok(RawEntry {
                seq: row.get(0)?,
                ts_utc: row.get(1)?,
                kind: row.get(2)?,
                payload_json: row.get(3)?,
                payload_hash: row.get(4)?,
                prev_hash: row.get(5)?,
                entry_hash: row.get(6)?,
            })
        })
        .ctx_journal("query events")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Journal entries with `seq > after_seq`, oldest first.
pub(crate) fn entries_since(conn: &Connection, after_seq: i64) -> Result<Vec<JournalEntry>> {
    raw_entries(conn, after_seq)?
        .into_iter()
        .map(|raw| {
            let event: LedgerEvent = serde_json::from_str(&raw.payload_json)
                .map_err(|e| ProvcertError::Journal(format!("decode event seq {}: {e}", raw.seq)))?;
            Ok(JournalEntry {
                seq: raw.seq,
                ts_utc: raw.ts_utc,
                event,
                payload_hash_hex: hex::encode(raw.payload_hash),
                prev_hash_hex: hex::encode(raw.prev_hash),
                entry_hash_hex: hex::encode(raw.entry_hash),
            })
        })
        .collect()
}

/// Re-derive the hash chain and check every record against the event that
/// created it; returns the number of verified entries.
pub(crate) fn verify(conn: &Connection) -> Result<usize> {
    let entries = raw_entries(conn, 0)?;
    let mut prev_hash = vec![0u8; 32];
    let mut expected_seq = 1;
    let mut counts = EventCounts::default();
    for e in &entries {
        if e.seq != expected_seq {
            return Err(ProvcertError::Journal(format!(
                "sequence gap: expected {expected_seq}, found {}",
                e.seq
            )));
        }
        let payload_hash = util::sha256(e.payload_json.as_bytes());
        if payload_hash.as_slice() != e.payload_hash.as_slice() {
            return Err(ProvcertError::Journal(format!(
                "payload_hash mismatch at seq {}",
                e.seq
            )));
        }
        if prev_hash != e.prev_hash {
            return Err(ProvcertError::Journal(format!(
                "prev_hash mismatch at seq {}",
                e.seq
            )));
        }
        let hash = entry_hash(&prev_hash, &payload_hash, &e.kind, e.seq, &e.ts_utc);
        if hash.as_slice() != e.entry_hash.as_slice() {
            return Err(ProvcertError::Journal(format!(
                "entry_hash mismatch at seq {}",
                e.seq
            )));
        }
        let event: LedgerEvent = serde_json::from_str(&e.payload_json)
            .map_err(|err| ProvcertError::Journal(format!("decode event seq {}: {err}", e.seq)))?;
        if event.kind() != e.kind {
            return Err(ProvcertError::Journal(format!("kind mismatch at seq {}", e.seq)));
        }
        check_record(conn, e.seq, &event)?;
        counts.add(&event);

        prev_hash = hash.to_vec();
        expected_seq += 1;
    }
    counts.check_against_tables(conn)?;
    Ok(entries.len())
}

/// The record an event created must still exist and hash as journaled.
fn check_record(conn: &Connection, seq: i64, event: &LedgerEvent) -> Result<()> {
    let mismatch = |what: String| ProvcertError::Journal(format!("{what} at seq {seq}"));
    match event {
        LedgerEvent::AddEntity {
            entity_id,
            entity_mode,
        } => {
            let entity = load_entity(conn, entity_id)?
                .ok_or_else(|| mismatch(format!("entity {entity_id} missing")))?;
            if entity.mode != *entity_mode {
                return Err(mismatch(format!("entity {entity_id} mode mismatch")));
            }
        }
        LedgerEvent::AddBatch {
            batch_id,
            record_hash,
            ..
        } => {
            let batch = load_batch(conn, *batch_id)?
                .ok_or_else(|| mismatch(format!("batch {batch_id} missing")))?;
            if batch.record_hash()? != *record_hash {
                return Err(mismatch(format!("batch {batch_id} record_hash mismatch")));
            }
        }
        LedgerEvent::IssueCertificate {
            certificate_id,
            record_hash,
            ..
        } => {
            let cert = load_certificate(conn, *certificate_id)?
                .ok_or_else(|| mismatch(format!("certificate {certificate_id} missing")))?;
            if cert.record_hash()? != *record_hash {
                return Err(mismatch(format!(
                    "certificate {certificate_id} record_hash mismatch"
                )));
            }
        }
    }
    Ok(())
}

/// Events seen per kind, compared with row counts so that rows inserted
/// behind the journal's back are caught too.
#[derive(Default)]
struct EventCounts {
    entities: i64,
    batches: i64,
    certificates: i64,
}

impl EventCounts {
    fn add(&mut self, event: &LedgerEvent) {
        match event {
            LedgerEvent::AddEntity { .. } => self.entities += 1,
            LedgerEvent::AddBatch { .. } => self.batches += 1,
            LedgerEvent::IssueCertificate { .. } => self.certificates += 1,
        }
    }

    fn check_against_tables(&self, conn: &Connection) -> Result<()> {
        let expected = [
            ("entities", self.entities),
            ("batches", self.batches),
            ("certificates", self.certificates),
            ("batch_certificates", self.certificates),
        ];
        for (table, journaled) in expected {
            let rows: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .ctx_journal(&format!("count {table}"))?;
            if rows != journaled {
                return Err(ProvcertError::Journal(format!(
                    "{table} holds {rows} rows but the journal records {journaled}"
                )));
            }
        }
        // Each batch link must agree with its certificate's batch_id.
        let misplaced: i64 = conn
            .query_row(
                r#"
                SELECT COUNT(*) FROM batch_certificates bc
                LEFT JOIN certificates c ON c.id = bc.certificate_id
                WHERE c.id IS NULL OR c.batch_id != bc.batch_id
                "#,
                [],
                |row| row.get(0),
            )
            .ctx_journal("check batch links")?;
        if misplaced != 0 {
            return Err(ProvcertError::Journal(format!(
                "{misplaced} batch certificate links disagree with their certificates"
            )));
        }
        Ok(())
    }
}
