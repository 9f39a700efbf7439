//! Produce-or-reuse decisions for persisted artifacts.
//!
//! Every artifact in the store (key, CSR, certificate, ledger, CRL) goes
//! through [`should_produce`] before it is written. Keys answer to the
//! `new_keys` flag, everything else to the certificate flag of the CA that
//! owns or signs it.

use crate::error::{Error, Result};
use crate::types::CaLevel;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Returns `true` when the artifact at `path` has to be (re)generated.
pub fn should_produce(path: impl AsRef<Path>, force: bool) -> bool {
    let path = path.as_ref();
    if force {
        return true;
    }
    let missing = !path.exists();
    if !missing {
        debug!(path = %path.display(), "artifact present, reusing");
    }
    missing
}

/// Regeneration switches, mirroring `FORCE_NEW_KEYS` / `FORCE_NEW_CERTS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForceFlags {
    /// Regenerate every private key.
    pub new_keys: bool,
    /// Regenerate every certificate, ledger and CRL.
    pub new_certs: bool,
    /// Per-CA override of `new_certs` for the root instance.
    pub root: Option<bool>,
    /// Per-CA override of `new_certs` for the intermediate instance.
    pub intermediate: Option<bool>,
}

impl ForceFlags {
    /// Certificate-level force flag for everything `level` owns or signs.
    pub fn certs_for(&self, level: CaLevel) -> bool {
        let specific = match level {
            CaLevel::Root => self.root,
            CaLevel::Intermediate => self.intermediate,
        };
        specific.unwrap_or(self.new_certs)
    }

    pub fn keys(&self) -> bool {
        self.new_keys
    }

    /// Fresh keys under reused certificates would leave certificates that no
    /// longer match their keys, so that combination is refused.
    pub fn validate(&self) -> Result<()> {
        if !self.new_keys {
            return Ok(());
        }
        let unforced: Vec<&str> = [CaLevel::Root, CaLevel::Intermediate]
            .into_iter()
            .filter(|level| !self.certs_for(*level))
            .map(|level| level.as_str())
            .collect();
        if unforced.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "new keys were forced but certificates were not for: {} (set FORCE_NEW_CERTS as well)",
                unforced.join(", ")
            )))
        }
    }

    /// Applies `FORCE_NEW_KEYS` / `FORCE_NEW_CERTS` from the environment.
    pub fn apply_env(&mut self) {
        if let Some(value) = env_flag("FORCE_NEW_KEYS") {
            self.new_keys = value;
        }
        if let Some(value) = env_flag("FORCE_NEW_CERTS") {
            self.new_certs = value;
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| parse_flag(&v))
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
