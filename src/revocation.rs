//! Backdated revocation of issued certificates.

use crate::ca::CaInstance;
use crate::error::Result;
use crate::ledger::format_serial;
use crate::types::RevocationReason;
use chrono::{DateTime, Utc};
use tracing::info;

/// Revocation settings: when the certificate is recorded as revoked and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevocationApplier {
    pub at: DateTime<Utc>,
    pub reason: Option<RevocationReason>,
}

impl RevocationApplier {
    pub fn new(at: DateTime<Utc>, reason: Option<RevocationReason>) -> Self {
        Self { at, reason }
    }

    /// Marks `serial` revoked in `ca`'s ledger and persists it. The timestamp
    /// is taken as given, even when it lies before the issuance.
    pub fn apply(&self, ca: &mut CaInstance, serial: u64) -> Result<()> {
        ca.revoke(serial, self.at, self.reason)?;
        info!(
            ca = %ca.level(),
            serial = %format_serial(serial),
            at = %self.at,
            reason = self.reason.map(|r| r.openssl_name()).unwrap_or("none"),
            "certificate revoked"
        );
        Ok(())
    }
}
