use crate::engine::{CryptoEngine, IssuedCertificate, KeyMaterial};
use crate::error::{Error, Result};
use crate::gate::{should_produce, ForceFlags};
use crate::inspect::parse_pem_certificate;
use crate::ledger::{format_serial, Ledger, LedgerEntry};
use crate::store::{write_atomic, CaStore, KeyRegistry};
use crate::types::{CaLevel, RevocationReason};
use chrono::{DateTime, Utc};
use std::fs;
use tracing::{debug, info, warn};

/// Settings the initializer needs besides the store itself.
#[derive(Debug, Clone)]
pub struct InitOptions {
    pub initial_serial: u64,
    pub force: ForceFlags,
    /// Base URL under which `<level>.crl` is published, if any.
    pub crl_base_url: Option<String>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            initial_serial: 0x1000,
            force: ForceFlags::default(),
            crl_base_url: None,
        }
    }
}

/// One certificate authority level with its ledger and counters.
#[derive(Debug)]
pub struct CaInstance {
    store: CaStore,
    ledger: Ledger,
    next_serial: u64,
    next_crl_number: u64,
    crl_url: Option<String>,
    changed: bool,
    key_generated: bool,
    ledger_reset: bool,
}

impl CaInstance {
    /// Prepares the on-disk state of a CA level: directories, ledger and
    /// counters (reset when gated), and the passphrase-protected key.
    pub fn initialize(
        store: CaStore,
        engine: &dyn CryptoEngine,
        passphrase: &str,
        options: &InitOptions,
        registry: &KeyRegistry,
    ) -> Result<Self> {
        let level = store.level();
        if passphrase.is_empty() {
            return Err(Error::MissingPassphrase(format!("{} CA key", level)));
        }

        store.ensure_layout()?;

        let force_certs = options.force.certs_for(level);
        let ledger_reset = should_produce(store.index_path(), force_certs);
        if ledger_reset {
            if store.index_path().exists() {
                warn!(ca = %level, "resetting issuance ledger");
            }
            reset_ledger(&store, options.initial_serial)?;
            info!(ca = %level, initial_serial = %format_serial(options.initial_serial), "ledger initialized");
        }

        let crl_url = options
            .crl_base_url
            .as_deref()
            .map(|base| format!("{}/{}.crl", base.trim_end_matches('/'), level));
        let mut instance = Self::load(store, crl_url)?;
        instance.ledger_reset = ledger_reset;

        let key_path = instance.store.key_path();
        if should_produce(&key_path, options.force.keys()) {
            engine.generate_key(passphrase)?.save(&key_path)?;
            instance.key_generated = true;
            info!(ca = %level, path = %key_path.display(), "CA key generated");
        }
        registry.publish(level.as_str(), &key_path)?;

        Ok(instance)
    }

    /// Loads an already initialized CA level without touching disk.
    pub fn open(store: CaStore) -> Result<Self> {
        if !store.index_path().exists() {
            return Err(Error::NotFound(format!(
                "{} CA ledger at {}",
                store.level(),
                store.index_path().display()
            )));
        }
        Self::load(store, None)
    }

    fn load(store: CaStore, crl_url: Option<String>) -> Result<Self> {
        let ledger = Ledger::parse(&fs::read_to_string(store.index_path())?)?;
        let counter = store.read_counter(&store.serial_path())?;
        let next_crl_number = store.read_counter(&store.crl_number_path())?;

        // The counter is written before the index, so it can only run ahead.
        let next_serial = match ledger.last_serial() {
            Some(last) => {
                let after_last = last.checked_add(1).ok_or_else(|| {
                    Error::Ledger(format!("{} CA serial space exhausted", store.level()))
                })?;
                counter.max(after_last)
            }
            None => counter,
        };
        debug!(
            ca = %store.level(),
            entries = ledger.len(),
            next_serial = %format_serial(next_serial),
            "ledger loaded"
        );

        Ok(Self {
            store,
            ledger,
            next_serial,
            next_crl_number,
            crl_url,
            changed: false,
            key_generated: false,
            ledger_reset: false,
        })
    }

    pub fn level(&self) -> CaLevel {
        self.store.level()
    }

    pub fn store(&self) -> &CaStore {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn next_serial(&self) -> u64 {
        self.next_serial
    }

    pub fn next_crl_number(&self) -> u64 {
        self.next_crl_number
    }

    pub fn crl_url(&self) -> Option<&str> {
        self.crl_url.as_deref()
    }

    pub fn key(&self) -> Result<KeyMaterial> {
        KeyMaterial::load(self.store.key_path())
    }

    pub fn certificate_pem(&self) -> Result<String> {
        let path = self.store.cert_path();
        fs::read_to_string(&path).map_err(|e| {
            Error::NotFound(format!("{} CA certificate {}: {}", self.level(), path.display(), e))
        })
    }

    /// True once this run issued or revoked anything against the ledger.
    pub fn has_changed(&self) -> bool {
        self.changed
    }

    pub fn key_generated(&self) -> bool {
        self.key_generated
    }

    pub fn ledger_reset(&self) -> bool {
        self.ledger_reset
    }

    /// Appends the ledger row for a freshly signed certificate and archives
    /// it under `newcerts/`.
    pub fn record_issuance(&mut self, issued: &IssuedCertificate) -> Result<()> {
        if issued.serial != self.next_serial {
            return Err(Error::Ledger(format!(
                "{} CA expected serial {}, got {}",
                self.level(),
                format_serial(self.next_serial),
                format_serial(issued.serial)
            )));
        }

        let next_serial = issued.serial.checked_add(1).ok_or_else(|| {
            Error::Ledger(format!("{} CA serial space exhausted", self.level()))
        })?;

        let parsed = parse_pem_certificate(&issued.pem)?;
        let entry = LedgerEntry::new(issued.serial, parsed.not_after, parsed.subject_slashed);
        self.ledger.push(entry)?;

        write_atomic(&self.store.newcert_path(issued.serial), &issued.pem)?;
        self.next_serial = next_serial;
        self.store
            .write_counter(&self.store.serial_path(), self.next_serial)?;
        self.persist_ledger()?;
        self.changed = true;
        Ok(())
    }

    pub fn revoke(
        &mut self,
        serial: u64,
        at: DateTime<Utc>,
        reason: Option<RevocationReason>,
    ) -> Result<()> {
        self.ledger.revoke(serial, at, reason)?;
        self.persist_ledger()?;
        self.changed = true;
        Ok(())
    }

    /// Advances the CRL counter past `number` once that CRL is signed.
    pub fn commit_crl_number(&mut self, number: u64) -> Result<()> {
        if number != self.next_crl_number {
            return Err(Error::Ledger(format!(
                "{} CA expected CRL number {}, got {}",
                self.level(),
                format_serial(self.next_crl_number),
                format_serial(number)
            )));
        }
        self.next_crl_number = number.checked_add(1).ok_or_else(|| {
            Error::Ledger(format!("{} CA CRL numbers exhausted", self.level()))
        })?;
        self.store
            .write_counter(&self.store.crl_number_path(), self.next_crl_number)
    }

    fn persist_ledger(&self) -> Result<()> {
        write_atomic(&self.store.index_path(), self.ledger.render())
    }
}

/// Clears every trace of the previous ledger. The index is written last so an
/// interrupted reset is redone on the next run.
fn reset_ledger(store: &CaStore, initial_serial: u64) -> Result<()> {
    store.clear_newcerts()?;
    let crl = store.crl_path();
    if crl.exists() {
        fs::remove_file(&crl)?;
    }
    store.write_counter(&store.serial_path(), initial_serial)?;
    store.write_counter(&store.crl_number_path(), initial_serial)?;
    write_atomic(&store.index_path(), "")
}
