//! Signature verification: recover who signed a stored certificate.
//!
//! Verification never touches ledger state.  It needs only the message hash,
//! the stored signature and the claimed signer's identity, so it works just
//! as well on a certificate taken from an exported snapshot.

use tracing::{debug, warn};

use crate::error::Result;
use crate::ledger::Ledger;
use crate::model::{Certificate, CertificateId};
use crate::signing;

/// `true` iff `claimed_signer` produced `cert`'s signature over
/// `message_hash`.  Unrecoverable signatures match nobody.
pub fn signature_matches(cert: &Certificate, message_hash: &[u8; 32], claimed_signer: &str) -> bool {
    match signing::recover_identity(message_hash, &cert.signature) {
        Ok(recovered) => {
            let matched = recovered == claimed_signer;
            debug!(certificate_id = cert.id, %recovered, claimed_signer, matched, "signer recovered");
            matched
        }
        Err(e) => {
            warn!(certificate_id = cert.id, error = %e, "signature recovery failed");
            false
        }
    }
}

impl Ledger {
    /// Recover the signer of certificate `certificate_id` over
    /// `message_hash` and compare it with `claimed_signer`.
    ///
    /// The recorded issuer is deliberately not consulted; callers wanting
    /// that cross-check compare against [`Certificate::issuer`] themselves.
    pub fn is_matching_signature(
        &self,
        message_hash: &[u8; 32],
        certificate_id: CertificateId,
        claimed_signer: &str,
    ) -> Result<bool> {
        let cert = self.get_certificate(certificate_id)?;
        Ok(signature_matches(&cert, message_hash, claimed_signer))
    }

    /// Identity that produced certificate `certificate_id`'s signature over
    /// `message_hash`.
    pub fn recover_signer(
        &self,
        message_hash: &[u8; 32],
        certificate_id: CertificateId,
    ) -> Result<String> {
        let cert = self.get_certificate(certificate_id)?;
        signing::recover_identity(message_hash, &cert.signature)
    }
}
