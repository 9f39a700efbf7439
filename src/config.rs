//! Provisioning configuration.

use crate::engine::RcgenEngine;
use crate::error::{Error, Result};
use crate::gate::ForceFlags;
use crate::types::{CertSigAlgo, DistinguishedName, RevocationReason, Validity};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Passphrase override applied to both the CA and the leaf keys.
pub const PASSPHRASE_ENV: &str = "PKI_FIXTURES_PASSPHRASE";

/// Everything one provisioning run needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureConfig {
    /// Directory holding `root/`, `intermediate/` and `keys/`.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// First serial of a fresh ledger, also the first CRL number.
    #[serde(default = "default_initial_serial")]
    pub initial_serial: u64,

    /// `nextUpdate` offset of emitted CRLs, in days.
    #[serde(default = "default_crl_days")]
    pub crl_days: u32,

    #[serde(default = "default_key_algorithm")]
    pub key_algorithm: CertSigAlgo,

    /// PBKDF2 rounds used when encrypting private keys.
    #[serde(default = "default_kdf_iterations")]
    pub key_kdf_iterations: u32,

    /// When set, CRL distribution points `<url>/<level>.crl` are embedded.
    #[serde(default)]
    pub crl_base_url: Option<String>,

    #[serde(default)]
    pub force: ForceFlags,

    #[serde(default)]
    pub organization: OrganizationConfig,

    #[serde(default)]
    pub passphrases: PassphraseConfig,

    #[serde(default)]
    pub validity: ValidityConfig,

    #[serde(default)]
    pub signers: SignerConfig,

    #[serde(default)]
    pub revocation: RevocationConfig,
}

/// Subject attributes shared by every certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationConfig {
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_organization")]
    pub organization: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub locality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseConfig {
    #[serde(default = "default_passphrase")]
    pub ca: String,
    #[serde(default = "default_passphrase")]
    pub leaf: String,
    /// Protects the PKCS#12 bundles.
    #[serde(default = "default_export_passphrase")]
    pub export: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidityConfig {
    #[serde(default = "default_root_validity")]
    pub root: Validity,
    #[serde(default = "default_intermediate_validity")]
    pub intermediate: Validity,
    #[serde(default = "default_ocsp_validity")]
    pub ocsp: Validity,
    #[serde(default = "default_tsa_validity")]
    pub tsa: Validity,
    #[serde(default = "default_signer_validity")]
    pub signer1: Validity,
    #[serde(default = "default_signer_validity")]
    pub signer2: Validity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerConfig {
    #[serde(default = "default_first_signer")]
    pub first: SignerIdentity,
    /// The identity that ends up revoked.
    #[serde(default = "default_second_signer")]
    pub second: SignerIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationConfig {
    #[serde(default = "default_revocation_at")]
    pub at: DateTime<Utc>,
    #[serde(default = "default_revocation_reason")]
    pub reason: Option<RevocationReason>,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            initial_serial: default_initial_serial(),
            crl_days: default_crl_days(),
            key_algorithm: default_key_algorithm(),
            key_kdf_iterations: default_kdf_iterations(),
            crl_base_url: None,
            force: ForceFlags::default(),
            organization: OrganizationConfig::default(),
            passphrases: PassphraseConfig::default(),
            validity: ValidityConfig::default(),
            signers: SignerConfig::default(),
            revocation: RevocationConfig::default(),
        }
    }
}

impl Default for OrganizationConfig {
    fn default() -> Self {
        Self {
            country: default_country(),
            organization: default_organization(),
            unit: default_unit(),
            state: None,
            locality: None,
        }
    }
}

impl Default for PassphraseConfig {
    fn default() -> Self {
        Self {
            ca: default_passphrase(),
            leaf: default_passphrase(),
            export: default_export_passphrase(),
        }
    }
}

impl Default for ValidityConfig {
    fn default() -> Self {
        Self {
            root: default_root_validity(),
            intermediate: default_intermediate_validity(),
            ocsp: default_ocsp_validity(),
            tsa: default_tsa_validity(),
            signer1: default_signer_validity(),
            signer2: default_signer_validity(),
        }
    }
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            first: default_first_signer(),
            second: default_second_signer(),
        }
    }
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            at: default_revocation_at(),
            reason: default_revocation_reason(),
        }
    }
}

impl FixtureConfig {
    /// Load config from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Applies `FORCE_NEW_KEYS`, `FORCE_NEW_CERTS` and the passphrase override.
    pub fn apply_env(&mut self) {
        self.force.apply_env();
        if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
            self.passphrases.ca = passphrase.clone();
            self.passphrases.leaf = passphrase;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.force.validate()?;

        for (name, value) in [
            ("passphrases.ca", &self.passphrases.ca),
            ("passphrases.leaf", &self.passphrases.leaf),
            ("passphrases.export", &self.passphrases.export),
        ] {
            if value.is_empty() {
                return Err(Error::MissingPassphrase(name.to_string()));
            }
        }

        let windows = [
            ("root", &self.validity.root),
            ("intermediate", &self.validity.intermediate),
            ("ocsp", &self.validity.ocsp),
            ("tsa", &self.validity.tsa),
            ("signer1", &self.validity.signer1),
            ("signer2", &self.validity.signer2),
        ];
        for (role, window) in windows {
            if !window.is_well_formed() {
                return Err(Error::Config(format!(
                    "validity.{}: not_before {} is not before not_after {}",
                    role, window.not_before, window.not_after
                )));
            }
        }

        if self.initial_serial == 0 || self.initial_serial > MAX_INITIAL_SERIAL {
            return Err(Error::Config(format!(
                "initial_serial must be between 1 and {:#X}",
                MAX_INITIAL_SERIAL
            )));
        }
        if self.crl_days == 0 || self.crl_days > MAX_CRL_DAYS {
            return Err(Error::Config(format!(
                "crl_days must be between 1 and {}",
                MAX_CRL_DAYS
            )));
        }

        if self.key_kdf_iterations == 0 {
            return Err(Error::Config("key_kdf_iterations must be positive".to_string()));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Subject for a certificate with the configured organization attributes.
    pub fn subject(&self, common_name: &str) -> DistinguishedName {
        let org = &self.organization;
        let mut dn = DistinguishedName::new(common_name)
            .with_country(&org.country)
            .with_organization(&org.organization)
            .with_organizational_unit(&org.unit);
        if let Some(ref state) = org.state {
            dn = dn.with_state(state);
        }
        if let Some(ref locality) = org.locality {
            dn = dn.with_locality(locality);
        }
        dn
    }
}

impl From<&FixtureConfig> for RcgenEngine {
    fn from(config: &FixtureConfig) -> Self {
        RcgenEngine::new(config.key_algorithm).with_kdf_iterations(config.key_kdf_iterations)
    }
}

// Default value functions for serde.
fn default_base_dir() -> PathBuf {
    PathBuf::from("pki")
}

/// Leaves headroom below `u64::MAX` for the serial and CRL counters.
const MAX_INITIAL_SERIAL: u64 = i64::MAX as u64;
const MAX_CRL_DAYS: u32 = 36_500;

const fn default_initial_serial() -> u64 {
    0x1000
}

const fn default_crl_days() -> u32 {
    30
}

const fn default_key_algorithm() -> CertSigAlgo {
    CertSigAlgo::EcdsaP256
}

const fn default_kdf_iterations() -> u32 {
    RcgenEngine::DEFAULT_KDF_ITERATIONS
}

fn default_country() -> String {
    String::from("BE")
}

fn default_organization() -> String {
    String::from("Example Inc")
}

fn default_unit() -> String {
    String::from("Testing Authority")
}

fn default_passphrase() -> String {
    String::from("secret")
}

fn default_export_passphrase() -> String {
    String::from("exportsecret")
}

fn utc(year: i32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn default_root_validity() -> Validity {
    Validity::new(utc(2000), utc(2500))
}

fn default_intermediate_validity() -> Validity {
    Validity::new(utc(2000), utc(2100))
}

fn default_ocsp_validity() -> Validity {
    Validity::new(utc(2020), utc(2030))
}

fn default_tsa_validity() -> Validity {
    Validity::new(utc(2000), utc(2030))
}

fn default_signer_validity() -> Validity {
    Validity::new(utc(2020), utc(2022))
}

fn default_first_signer() -> SignerIdentity {
    SignerIdentity {
        name: String::from("Alice"),
        email: String::from("alice@example.com"),
    }
}

fn default_second_signer() -> SignerIdentity {
    SignerIdentity {
        name: String::from("Bob"),
        email: String::from("bob@example.com"),
    }
}

fn default_revocation_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 12, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn default_revocation_reason() -> Option<RevocationReason> {
    Some(RevocationReason::KeyCompromise)
}
