//! pki-fixtures - idempotent provisioning of a disposable test PKI
//!
//! This library builds a small but complete certificate hierarchy for test
//! suites that need real X.509 material:
//!
//! - A self-signed root CA and a subordinate intermediate CA (pathLen 0)
//! - An OCSP responder and a timestamping authority
//! - Two end-entity signers exported as PKCS#12 bundles, the second one revoked
//!   with a fixed, backdated timestamp
//! - CRLs for both CA levels
//!
//! Every artifact is persisted under one base directory in the layout of an
//! `openssl ca` installation (`index.txt`, `serial`, `crlnumber`, `newcerts/`).
//! Reruns reuse whatever already exists, so serials stay stable across runs
//! unless regeneration is forced.
//!
//! # Examples
//!
//! ## Provisioning with defaults
//!
//! ```no_run
//! use pki_fixtures::{provision, FixtureConfig, RcgenEngine};
//!
//! let mut config = FixtureConfig::default();
//! config.base_dir = "target/pki".into();
//!
//! let engine = RcgenEngine::from(&config);
//! let report = provision(&engine, &config).unwrap();
//! for step in report.produced() {
//!     println!("{} -> {}", step.artifact, step.path.display());
//! }
//! ```
//!
//! ## Reading the intermediate ledger
//!
//! ```no_run
//! use pki_fixtures::{ArtifactStore, CaInstance, CaLevel};
//!
//! let store = ArtifactStore::new("target/pki");
//! let ca = CaInstance::open(store.ca(CaLevel::Intermediate)).unwrap();
//! for entry in ca.ledger().revoked() {
//!     println!("{} revoked: {}", entry.serial_hex(), entry.subject);
//! }
//! ```

pub mod ca;
pub mod config;
pub mod crl;
pub mod engine;
pub mod error;
pub mod gate;
pub mod hierarchy;
pub mod inspect;
pub mod ledger;
pub mod revocation;
pub mod store;
pub mod types;

#[cfg(feature = "cli")]
pub mod cli;

pub use error::{Error, Result};

pub use ca::{CaInstance, InitOptions};
pub use config::FixtureConfig;
pub use crl::CrlEmitter;
pub use engine::{
    CertificateBundle, CertificateRequest, Crl, CryptoEngine, IssuedCertificate, KeyMaterial,
    RcgenEngine,
};
pub use gate::{should_produce, ForceFlags};
pub use hierarchy::{provision, Hierarchy, LeafRole, ProvisionReport};
pub use inspect::{CertificateChainInfo, ParsedCertificate, ParsedCrl};
pub use ledger::{Ledger, LedgerEntry};
pub use revocation::RevocationApplier;
pub use store::ArtifactStore;
pub use types::{
    CaLevel, CertSigAlgo, DistinguishedName, ExtensionProfile, RevocationReason, Validity,
};

#[cfg(test)]
mod tests {
    use super::*;
    use inspect::{parse_pem_certificate, verify_issued_by};

    fn config(dir: &std::path::Path) -> FixtureConfig {
        FixtureConfig {
            base_dir: dir.to_path_buf(),
            key_kdf_iterations: 16,
            ..FixtureConfig::default()
        }
    }

    #[test]
    fn test_provision_creates_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let engine = RcgenEngine::from(&config);

        let report = provision(&engine, &config).unwrap();
        assert!(!report.is_noop());
        assert!(report.revoked_serial.is_some());

        let store = ArtifactStore::new(dir.path());
        let root = std::fs::read_to_string(store.ca(CaLevel::Root).cert_path()).unwrap();
        let tsa = std::fs::read_to_string(store.ca(CaLevel::Root).leaf_cert_path("tsa")).unwrap();
        assert!(verify_issued_by(&tsa, &root).is_ok());
        assert!(parse_pem_certificate(&root).unwrap().is_ca);
    }

    #[test]
    fn test_algorithm_parsing() {
        assert!(matches!(
            "ed25519".parse::<CertSigAlgo>(),
            Ok(CertSigAlgo::Ed25519)
        ));
        assert!(matches!(
            "ecdsa-p256".parse::<CertSigAlgo>(),
            Ok(CertSigAlgo::EcdsaP256)
        ));
        assert!(matches!(
            "rsa4096".parse::<CertSigAlgo>(),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_keys_forced_without_certs_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.force.new_keys = true;
        let engine = RcgenEngine::from(&config);

        assert!(matches!(provision(&engine, &config), Err(Error::Config(_))));
        assert!(!dir.path().join("root").exists());
    }
}
