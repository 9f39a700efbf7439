//! CRL emission for each CA level.

use crate::ca::CaInstance;
use crate::engine::{Crl, CryptoEngine};
use crate::error::Result;
use crate::gate::{should_produce, ForceFlags};
use crate::ledger::format_serial;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct CrlEmitter {
    validity_days: u32,
    force: ForceFlags,
}

impl CrlEmitter {
    pub fn new(validity_days: u32, force: ForceFlags) -> Self {
        Self {
            validity_days,
            force,
        }
    }

    /// A CRL is due when none exists, the CA is forced, or the ledger moved
    /// during this run.
    pub fn is_due(&self, ca: &CaInstance) -> bool {
        ca.has_changed() || should_produce(ca.store().crl_path(), self.force.certs_for(ca.level()))
    }

    /// Signs and writes the CRL of `ca` when due; `None` means the existing
    /// file was kept.
    pub fn emit(
        &self,
        engine: &dyn CryptoEngine,
        ca: &mut CaInstance,
        passphrase: &str,
    ) -> Result<Option<Crl>> {
        if !self.is_due(ca) {
            return Ok(None);
        }

        let crl = engine.generate_crl(ca, self.validity_days, passphrase)?;
        let path = ca.store().crl_path();
        crl.save(&path)?;
        info!(
            ca = %ca.level(),
            number = %format_serial(crl.number),
            revoked = ca.ledger().revoked().count(),
            path = %path.display(),
            "CRL written"
        );
        Ok(Some(crl))
    }
}
