use anyhow::Result;
use secrecy::SecretString;
use tempfile::tempdir;

use provcert_core::{
    error::{ErrorClass, ProvcertError},
    ledger::{self, Ledger, LedgerPolicy},
    model::{Mode, StatusPipeline},
    signing::{self, Secp256k1Signer, Signer as _},
};

#[test]
fn corrupt_db_rejected() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("corrupt.db");
    std::fs::write(&db_path, b"not-a-sqlite-db")?;

    let err = Ledger::open_existing(&db_path, None, LedgerPolicy::default()).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Internal);
    Ok(())
}

#[test]
fn missing_db_rejected() -> Result<()> {
    let dir = tempdir()?;
    let err = Ledger::open_existing(&dir.path().join("absent.db"), None, LedgerPolicy::default())
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));
    Ok(())
}

#[test]
fn create_refuses_existing_ledger() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("ledger.db");
    Ledger::create_new(&db_path, None, LedgerPolicy::default())?;
    assert!(Ledger::create_new(&db_path, None, LedgerPolicy::default()).is_err());
    Ok(())
}

#[test]
fn pipeline_mismatch_on_reopen_rejected() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("ledger.db");
    Ledger::create_new(&db_path, None, LedgerPolicy::default())?;

    let policy = LedgerPolicy {
        pipeline: StatusPipeline::new(["GROWN", "HARVESTED"])?,
        ..LedgerPolicy::default()
    };
    let err = Ledger::open_existing(&db_path, None, policy).unwrap_err();
    assert!(err.to_string().contains("status pipeline"));
    Ok(())
}

#[test]
fn missing_signing_key_rejected() {
    let err = Secp256k1Signer::from_key_pem("missing_key.pem".as_ref()).unwrap_err();
    assert!(err.to_string().contains("read key"));
}

#[test]
fn duplicate_entity_keeps_first_mode() -> Result<()> {
    let mut ledger = Ledger::open_in_memory(LedgerPolicy::default())?;
    ledger.add_entity("admin", "inspector", Mode::Issuer)?;
    let err = ledger.add_entity("admin", "inspector", Mode::Prover).unwrap_err();
    assert!(matches!(err, ProvcertError::DuplicateEntity(_)));
    assert_eq!(ledger.get_entity("inspector")?.mode, Mode::Issuer);
    assert_eq!(ledger.verify_journal()?, 1);
    Ok(())
}

#[test]
fn rejected_issuance_leaves_state_unchanged() -> Result<()> {
    let issuer = Secp256k1Signer::random();
    let prover = Secp256k1Signer::random();
    let mut ledger = Ledger::open_in_memory(LedgerPolicy::default())?;
    ledger.add_entity("admin", issuer.identity(), Mode::Issuer)?;
    ledger.add_entity("admin", prover.identity(), Mode::Prover)?;
    let batch_id = ledger.add_batch("admin", "South_Africa", prover.identity())?;

    let hash = signing::attestation_hash(prover.identity(), batch_id, prover.identity(), "SUPPLIED");
    let sig = prover.sign_prehash(&hash)?;

    // A prover cannot certify.
    let err = ledger
        .issue_certificate("admin", prover.identity(), prover.identity(), "SUPPLIED", batch_id, &sig)
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Authorization);

    // Unknown prover, unknown batch, unknown status, empty signature.
    let err = ledger
        .issue_certificate("admin", issuer.identity(), "ghost", "SUPPLIED", batch_id, &sig)
        .unwrap_err();
    assert!(matches!(err, ProvcertError::UnknownEntity(_)));
    let err = ledger
        .issue_certificate("admin", issuer.identity(), prover.identity(), "SUPPLIED", 9, &sig)
        .unwrap_err();
    assert!(matches!(err, ProvcertError::UnknownBatch(9)));
    let err = ledger
        .issue_certificate("admin", issuer.identity(), prover.identity(), "MINED", batch_id, &sig)
        .unwrap_err();
    assert!(matches!(err, ProvcertError::InvalidStatus(_)));
    let err = ledger
        .issue_certificate("admin", issuer.identity(), prover.identity(), "SUPPLIED", batch_id, &[])
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);

    assert_eq!(ledger.certificate_count()?, 0);
    assert!(ledger.get_batch(batch_id)?.certificate_ids.is_empty());
    assert_eq!(ledger.verify_journal()?, 3);
    Ok(())
}

#[test]
fn stage_regression_rejected_by_default() -> Result<()> {
    let issuer = Secp256k1Signer::random();
    let prover = Secp256k1Signer::random();
    let mut ledger = Ledger::open_in_memory(LedgerPolicy::default())?;
    ledger.add_entity("admin", issuer.identity(), Mode::Issuer)?;
    ledger.add_entity("admin", prover.identity(), Mode::Prover)?;
    let batch_id = ledger.add_batch("admin", "Congo", prover.identity())?;

    let mut issue = |status: &str| -> provcert_core::Result<u64> {
        let hash = signing::attestation_hash(issuer.identity(), batch_id, prover.identity(), status);
        let sig = issuer.sign_prehash(&hash)?;
        ledger.issue_certificate("admin", issuer.identity(), prover.identity(), status, batch_id, &sig)
    };

    issue("ROUGH_TRADE")?;
    issue("ROUGH_TRADE")?;
    let err = issue("SUPPLIED").unwrap_err();
    assert!(matches!(err, ProvcertError::StageRegression { .. }));
    issue("POLISHED_TRADE")?;
    Ok(())
}

#[test]
fn unknown_lookups_are_not_found() -> Result<()> {
    let ledger = Ledger::open_in_memory(LedgerPolicy::default())?;
    assert_eq!(ledger.get_entity("nobody").unwrap_err().class(), ErrorClass::NotFound);
    assert_eq!(ledger.get_batch(0).unwrap_err().class(), ErrorClass::NotFound);
    assert_eq!(ledger.get_certificate(0).unwrap_err().class(), ErrorClass::NotFound);
    assert_eq!(ErrorClass::NotFound.exit_code(), 3);
    Ok(())
}

#[cfg(not(feature = "sqlcipher"))]
#[test]
fn db_key_without_sqlcipher_rejected_up_front() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("ledger.db");
    let key = SecretString::new("correct horse".into());

    let err = Ledger::create_new(&db_path, Some(&key), LedgerPolicy::default()).unwrap_err();
    assert!(err.to_string().contains("no SQLCipher support"));
    assert!(!db_path.exists());
    assert!(!ledger::db_salt_path(&db_path).exists());

    Ledger::create_new(&db_path, None, LedgerPolicy::default())?;
    let err = Ledger::open_existing(&db_path, Some(&key), LedgerPolicy::default()).unwrap_err();
    assert!(err.to_string().contains("no SQLCipher support"));
    Ok(())
}

#[cfg(feature = "sqlcipher")]
#[test]
fn encrypted_ledger_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("ledger.db");
    let key = SecretString::new("correct horse".into());

    {
        let mut ledger = Ledger::create_new(&db_path, Some(&key), LedgerPolicy::default())?;
        assert!(ledger.meta().sqlcipher_cipher_version.is_some());
        ledger.add_entity("admin", "inspector", Mode::Issuer)?;
    }
    assert!(ledger::db_salt_path(&db_path).exists());
    let header = std::fs::read(&db_path)?;
    assert!(!header.starts_with(b"SQLite format 3\0"));

    let ledger = Ledger::open_existing(&db_path, Some(&key), LedgerPolicy::default())?;
    assert_eq!(ledger.get_entity("inspector")?.mode, Mode::Issuer);
    assert_eq!(ledger.verify_journal()?, 1);
    drop(ledger);

    let wrong = SecretString::new("battery staple".into());
    assert!(Ledger::open_existing(&db_path, Some(&wrong), LedgerPolicy::default()).is_err());
    assert!(Ledger::open_existing(&db_path, None, LedgerPolicy::default()).is_err());
    // A second create must not clobber the salt of the existing ledger.
    assert!(Ledger::create_new(&db_path, Some(&key), LedgerPolicy::default()).is_err());
    assert!(Ledger::open_existing(&db_path, Some(&key), LedgerPolicy::default()).is_ok());
    Ok(())
}
