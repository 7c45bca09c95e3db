//! Entity registry: identity-to-role bindings.

use rusqlite::{params, Connection, OptionalExtension as _};
use tracing::debug;

use crate::error::{ProvcertError, Result, ResultExt as _};
use crate::events::LedgerEvent;
use crate::journal;
use crate::ledger::{begin_write, Ledger};
use crate::model::{Entity, Mode};
use crate::util;

pub(crate) fn load_entity(conn: &Connection, id: &str) -> Result<Option<Entity>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, mode, registered_at_utc FROM entities WHERE id=?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(id, mode, registered_at_utc)| {
        Ok(Entity {
            id,
            mode: mode
                .parse::<Mode>()
                .ctx_ledger("stored entity has an unknown mode")?,
            registered_at_utc,
        })
    })
    .transpose()
}

/// Resolve a referenced entity, reporting it as unknown when missing.
pub(crate) fn resolve_entity(conn: &Connection, id: &str) -> Result<Entity> {
    load_entity(conn, id)?.ok_or_else(|| ProvcertError::UnknownEntity(id.to_string()))
}

impl Ledger {
    /// Register `id` with a fixed `mode`.  Fails if `id` is already known.
    pub fn add_entity(&mut self, caller: &str, id: &str, mode: Mode) -> Result<Entity> {
        self.policy.authorize_admin(caller, "register entities")?;
        util::validate_entity_id(id)?;

        let tx = begin_write(&mut self.conn)?;
        if load_entity(&tx, id)?.is_some() {
            return Err(ProvcertError::DuplicateEntity(id.to_string()));
        }

        let entity = Entity {
            id: id.to_string(),
            mode,
            registered_at_utc: util::now_utc_rfc3339(),
        };
        tx.execute(
            "INSERT INTO entities(id, mode, registered_at_utc) VALUES (?1,?2,?3)",
            params![entity.id, entity.mode.as_str(), entity.registered_at_utc],
        )
        .ctx_ledger("insert entity")?;

        let entry = journal::append(
            &tx,
            &LedgerEvent::AddEntity {
                entity_id: entity.id.clone(),
                entity_mode: mode,
            },
        )?;
        tx.commit().ctx_ledger("commit tx")?;

        debug!(entity_id = %entity.id, mode = %mode, "entity registered");
        self.publish(&entry);
        Ok(entity)
    }

    /// Like [`Ledger::add_entity`] but takes the mode as text, as received
    /// from external callers.
    pub fn add_entity_str(&mut self, caller: &str, id: &str, mode: &str) -> Result<Entity> {
        let mode: Mode = mode.parse()?;
        self.add_entity(caller, id, mode)
    }

    pub fn get_entity(&self, id: &str) -> Result<Entity> {
        load_entity(&self.conn, id)?.ok_or_else(|| ProvcertError::entity_not_found(id))
    }

    /// All entities in registration order.
    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM entities ORDER BY rowid ASC")
            .ctx_ledger("prepare select entities")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .ctx_ledger("query entities")?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        ids.iter().map(|id| self.get_entity(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::events::MemorySink;
    use crate::ledger::LedgerPolicy;

    fn ledger() -> Ledger {
        Ledger::open_in_memory(LedgerPolicy::default().with_admin("admin")).unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let mut l = ledger();
        for (id, mode) in [
            ("supplierA", Mode::Prover),
            ("inspector", Mode::Issuer),
            ("retailer", Mode::Verifier),
        ] {
            l.add_entity("admin", id, mode).unwrap();
            let got = l.get_entity(id).unwrap();
            assert_eq!(got.id, id);
            assert_eq!(got.mode, mode);
        }
        let ids: Vec<_> = l.list_entities().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, ["supplierA", "inspector", "retailer"]);
    }

    #[test]
    fn duplicate_registration_fails_without_overwrite() {
        let mut l = ledger();
        l.add_entity("admin", "inspector", Mode::Issuer).unwrap();
        let err = l.add_entity("admin", "inspector", Mode::Prover).unwrap_err();
        assert!(matches!(err, ProvcertError::DuplicateEntity(ref id) if id == "inspector"));
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(l.get_entity("inspector").unwrap().mode, Mode::Issuer);
        assert_eq!(l.events_since(0).unwrap().len(), 1);
    }

    #[test]
    fn unknown_mode_text_rejected() {
        let mut l = ledger();
        let err = l.add_entity_str("admin", "x", "OWNER").unwrap_err();
        assert!(matches!(err, ProvcertError::InvalidMode(_)));
        assert!(l.list_entities().unwrap().is_empty());
    }

    #[test]
    fn empty_id_rejected() {
        let mut l = ledger();
        let err = l.add_entity("admin", "", Mode::Issuer).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn missing_entity_is_not_found() {
        let l = ledger();
        let err = l.get_entity("ghost").unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn non_admin_cannot_register() {
        let mut l = ledger();
        let err = l.add_entity("mallory", "mallory", Mode::Issuer).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Authorization);
        assert!(l.get_entity("mallory").is_err());
    }

    #[test]
    fn emits_add_entity_event() {
        let mut l = ledger();
        let sink = MemorySink::new();
        l.subscribe(Box::new(sink.clone()));
        l.add_entity("admin", "inspector", Mode::Issuer).unwrap();
        assert_eq!(
            sink.events(),
            vec![LedgerEvent::AddEntity {
                entity_id: "inspector".into(),
                entity_mode: Mode::Issuer,
            }]
        );
    }
}
