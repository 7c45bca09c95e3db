//! Ledger records: entities, batches, certificates and the status pipeline.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProvcertError, Result};

pub type BatchId = u64;
pub type CertificateId = u64;

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Role of a registered entity.  Fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Attests claims about other entities.
    Issuer,
    /// Is attested about.
    Prover,
    /// Consumes and checks attestations.
    Verifier,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Issuer, Mode::Prover, Mode::Verifier];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issuer => "ISSUER",
            Self::Prover => "PROVER",
            Self::Verifier => "VERIFIER",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ProvcertError;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ProvcertError::InvalidMode(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Status pipeline
// ---------------------------------------------------------------------------

/// One stage of a deployment's status pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    /// Zero-based position in the pipeline.
    pub position: u32,
}

/// The ordered set of certificate statuses a deployment accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusPipeline {
    stages: Vec<String>,
}

static STAGE_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"^[A-Z][A-Z0-9_]{0,63}$").unwrap());

impl StatusPipeline {
    pub fn new<I, S>(stages: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let stages: Vec<String> = stages.into_iter().map(Into::into).collect();
        if stages.is_empty() {
            return Err(ProvcertError::Validation(
                "status pipeline must have at least one stage".into(),
            ));
        }
        for (i, name) in stages.iter().enumerate() {
            if !STAGE_RE.is_match(name) {
                return Err(ProvcertError::Validation(format!(
                    "invalid stage name '{name}': uppercase letters, digits and underscores"
                )));
            }
            if stages[..i].contains(name) {
                return Err(ProvcertError::Validation(format!(
                    "duplicate stage name '{name}'"
                )));
            }
        }
        Ok(Self { stages })
    }

    /// The five-stage rough-to-polished diamond pipeline.
    pub fn diamond() -> Self {
        Self {
            stages: [
                "SUPPLIED",
                "ROUGH_EXPORT",
                "ROUGH_TRADE",
                "POLISHED_EXPORT",
                "POLISHED_TRADE",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }

    /// Resolve a status name to its stage.
    pub fn resolve(&self, status: &str) -> Result<Stage> {
        self.stages
            .iter()
            .position(|s| s == status)
            .map(|i| Stage {
                name: status.to_string(),
                position: i as u32,
            })
            .ok_or_else(|| ProvcertError::InvalidStatus(status.to_string()))
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub mode: Mode,
    pub registered_at_utc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    /// Provenance tag (mining location, product brand, ...).
    pub origin: String,
    pub custodian: String,
    /// Certificates attached to this batch, in issuance order.
    pub certificate_ids: Vec<CertificateId>,
    pub created_at_utc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub id: CertificateId,
    pub issuer: String,
    pub prover: String,
    pub status: Stage,
    pub batch_id: BatchId,
    /// Detached recoverable signature (`r || s || v`) made by the issuer.
    #[serde(with = "crate::util::serde_b64")]
    pub signature: Vec<u8>,
    pub issued_at_utc: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("ISSUER".parse::<Mode>().unwrap(), Mode::Issuer);
        assert_eq!("prover".parse::<Mode>().unwrap(), Mode::Prover);
        assert_eq!(" Verifier ".parse::<Mode>().unwrap(), Mode::Verifier);
    }

    #[test]
    fn unknown_mode_rejected() {
        let err = "AUDITOR".parse::<Mode>().unwrap_err();
        assert!(matches!(err, ProvcertError::InvalidMode(m) if m == "AUDITOR"));
    }

    #[test]
    fn diamond_pipeline_positions() {
        let p = StatusPipeline::diamond();
        assert_eq!(p.len(), 5);
        assert_eq!(p.resolve("SUPPLIED").unwrap().position, 0);
        assert_eq!(p.resolve("POLISHED_TRADE").unwrap().position, 4);
        assert!(matches!(
            p.resolve("supplied"),
            Err(ProvcertError::InvalidStatus(_))
        ));
    }

    #[test]
    fn pipeline_rejects_duplicates_and_bad_names() {
        assert!(StatusPipeline::new(Vec::<String>::new()).is_err());
        assert!(StatusPipeline::new(["MANUFACTURED", "MANUFACTURED"]).is_err());
        assert!(StatusPipeline::new(["has space"]).is_err());
        let pharma = StatusPipeline::new([
            "MANUFACTURED",
            "RELEASED",
            "DISTRIBUTED",
            "DISPENSED",
            "ADMINISTERED",
        ])
        .unwrap();
        assert_eq!(pharma.resolve("DISPENSED").unwrap().position, 3);
    }

    #[test]
    fn certificate_serializes_signature_as_base64() {
        let cert = Certificate {
            id: 0,
            issuer: "a".into(),
            prover: "b".into(),
            status: Stage {
                name: "SUPPLIED".into(),
                position: 0,
            },
            batch_id: 0,
            signature: vec![1, 2, 3],
            issued_at_utc: "2026-01-01T00:00:00Z".into(),
        };
        let json = serde_json::to_value(&cert).unwrap();
        assert_eq!(json["signature"], "AQID");
        let back: Certificate = serde_json::from_value(json).unwrap();
        assert_eq!(back, cert);
    }
}
