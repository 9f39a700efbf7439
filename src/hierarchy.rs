//! The provisioning pipeline.
//!
//! [`Hierarchy`] walks through its stages as a typestate: each stage consumes
//! the previous one, so a leaf can only be issued once both CA certificates
//! exist and CRLs can only be emitted after revocation has been settled.
//!
//! ```no_run
//! use pki_fixtures::{config::FixtureConfig, engine::RcgenEngine, hierarchy::Hierarchy};
//!
//! let config = FixtureConfig::default();
//! let engine = RcgenEngine::from(&config);
//! let report = Hierarchy::initialize(&engine, &config)?
//!     .issue_root()?
//!     .issue_intermediate()?
//!     .issue_leaves()?
//!     .apply_revocation()?
//!     .emit_crls()?;
//! println!("{} artifacts produced", report.produced().count());
//! # Ok::<(), pki_fixtures::Error>(())
//! ```

use crate::ca::{CaInstance, InitOptions};
use crate::config::FixtureConfig;
use crate::crl::CrlEmitter;
use crate::engine::{CryptoEngine, IssuedCertificate, KeyMaterial};
use crate::error::Result;
use crate::gate::should_produce;
use crate::ledger::format_serial;
use crate::revocation::RevocationApplier;
use crate::store::{write_atomic, ArtifactStore};
use crate::types::{CaLevel, DistinguishedName, ExtensionProfile, Validity};
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Both CA instances are initialized; nothing has been signed yet.
#[derive(Debug)]
pub struct Initialized;
/// The root certificate exists.
#[derive(Debug)]
pub struct RootReady;
/// The intermediate certificate and the chain file exist.
#[derive(Debug)]
pub struct IntermediateReady;
#[derive(Debug)]
pub struct LeavesIssued;
#[derive(Debug)]
pub struct Revoked;

/// Leaf certificates of the fixture PKI, in issuance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeafRole {
    Ocsp,
    Tsa,
    Signer1,
    Signer2,
}

impl LeafRole {
    pub const ALL: [LeafRole; 4] = [
        LeafRole::Ocsp,
        LeafRole::Tsa,
        LeafRole::Signer1,
        LeafRole::Signer2,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            LeafRole::Ocsp => "ocsp",
            LeafRole::Tsa => "tsa",
            LeafRole::Signer1 => "signer1",
            LeafRole::Signer2 => "signer2",
        }
    }

    /// The TSA chains directly to the root; every other leaf to the intermediate.
    pub fn issuer(&self) -> CaLevel {
        match self {
            LeafRole::Tsa => CaLevel::Root,
            _ => CaLevel::Intermediate,
        }
    }

    pub fn profile(&self) -> ExtensionProfile {
        match self {
            LeafRole::Ocsp => ExtensionProfile::OcspResponder,
            LeafRole::Tsa => ExtensionProfile::TimeStamping,
            LeafRole::Signer1 | LeafRole::Signer2 => ExtensionProfile::EndUser,
        }
    }

    pub fn is_signer(&self) -> bool {
        matches!(self, LeafRole::Signer1 | LeafRole::Signer2)
    }

    fn subject(&self, config: &FixtureConfig) -> DistinguishedName {
        match self {
            LeafRole::Ocsp => config.subject("OCSP Responder"),
            LeafRole::Tsa => config.subject("Time Stamping Authority"),
            LeafRole::Signer1 => config
                .subject(&config.signers.first.name)
                .with_email(&config.signers.first.email),
            LeafRole::Signer2 => config
                .subject(&config.signers.second.name)
                .with_email(&config.signers.second.email),
        }
    }

    fn validity<'c>(&self, config: &'c FixtureConfig) -> &'c Validity {
        match self {
            LeafRole::Ocsp => &config.validity.ocsp,
            LeafRole::Tsa => &config.validity.tsa,
            LeafRole::Signer1 => &config.validity.signer1,
            LeafRole::Signer2 => &config.validity.signer2,
        }
    }
}

impl fmt::Display for LeafRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Produced,
    Reused,
}

#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub artifact: String,
    pub path: PathBuf,
    pub outcome: Outcome,
    /// Serial or CRL number when the step signed something.
    pub serial: Option<String>,
}

/// Per-artifact record of one provisioning run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionReport {
    pub steps: Vec<Step>,
    /// Serial revoked during this run, if any.
    pub revoked_serial: Option<u64>,
}

impl ProvisionReport {
    fn record(&mut self, artifact: impl Into<String>, path: &Path, produced: bool) {
        self.steps.push(Step {
            artifact: artifact.into(),
            path: path.to_path_buf(),
            outcome: if produced {
                Outcome::Produced
            } else {
                Outcome::Reused
            },
            serial: None,
        });
    }

    fn record_signed(&mut self, artifact: impl Into<String>, path: &Path, serial: u64) {
        self.steps.push(Step {
            artifact: artifact.into(),
            path: path.to_path_buf(),
            outcome: Outcome::Produced,
            serial: Some(format_serial(serial)),
        });
    }

    pub fn produced(&self) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(|s| s.outcome == Outcome::Produced)
    }

    pub fn reused(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.outcome == Outcome::Reused)
    }

    /// True when the run changed nothing on disk.
    pub fn is_noop(&self) -> bool {
        self.produced().next().is_none()
    }

    pub fn step(&self, artifact: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.artifact == artifact)
    }
}

pub struct Hierarchy<'a, S> {
    engine: &'a dyn CryptoEngine,
    config: &'a FixtureConfig,
    store: ArtifactStore,
    root: CaInstance,
    intermediate: CaInstance,
    report: ProvisionReport,
    root_cert_produced: bool,
    intermediate_cert_produced: bool,
    signer2_issued: Option<u64>,
    _stage: PhantomData<S>,
}

impl<'a, S> Hierarchy<'a, S> {
    pub fn root(&self) -> &CaInstance {
        &self.root
    }

    pub fn intermediate(&self) -> &CaInstance {
        &self.intermediate
    }

    pub fn report(&self) -> &ProvisionReport {
        &self.report
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    fn advance<T>(self) -> Hierarchy<'a, T> {
        Hierarchy {
            engine: self.engine,
            config: self.config,
            store: self.store,
            root: self.root,
            intermediate: self.intermediate,
            report: self.report,
            root_cert_produced: self.root_cert_produced,
            intermediate_cert_produced: self.intermediate_cert_produced,
            signer2_issued: self.signer2_issued,
            _stage: PhantomData,
        }
    }

    fn ca(&self, level: CaLevel) -> &CaInstance {
        match level {
            CaLevel::Root => &self.root,
            CaLevel::Intermediate => &self.intermediate,
        }
    }

    fn ca_mut(&mut self, level: CaLevel) -> &mut CaInstance {
        match level {
            CaLevel::Root => &mut self.root,
            CaLevel::Intermediate => &mut self.intermediate,
        }
    }

    /// Whether certificates signed by `level` must be reissued regardless of
    /// what is on disk.
    fn issuer_forced(&self, level: CaLevel) -> bool {
        let ca = self.ca(level);
        self.config.force.certs_for(level) || ca.ledger_reset() || ca.key_generated()
    }

    /// CSR plus signature by `issuer`; the issuer's own certificate when
    /// `self_signed`.
    #[allow(clippy::too_many_arguments)]
    fn sign(
        &mut self,
        issuer: CaLevel,
        key: &KeyMaterial,
        key_passphrase: &str,
        subject: &DistinguishedName,
        profile: ExtensionProfile,
        validity: &Validity,
        csr_path: &Path,
        self_signed: bool,
    ) -> Result<IssuedCertificate> {
        let engine = self.engine;
        let config = self.config;
        let ca_passphrase = config.passphrases.ca.as_str();

        let csr = engine.create_csr(key, key_passphrase, subject)?;
        csr.save(csr_path)?;

        let ca = self.ca_mut(issuer);
        if self_signed {
            engine.self_sign_certificate(ca, &csr, profile, validity, ca_passphrase)
        } else {
            engine.sign_certificate(ca, &csr, profile, validity, ca_passphrase)
        }
    }
}

impl<'a> Hierarchy<'a, Initialized> {
    /// Validates `config` and initializes both CA instances.
    pub fn initialize(engine: &'a dyn CryptoEngine, config: &'a FixtureConfig) -> Result<Self> {
        config.validate()?;

        let store = ArtifactStore::new(&config.base_dir);
        let registry = store.keys();
        registry.ensure_layout()?;
        let options = InitOptions {
            initial_serial: config.initial_serial,
            force: config.force,
            crl_base_url: config.crl_base_url.clone(),
        };
        info!(base_dir = %store.base().display(), "provisioning fixture PKI");

        let mut report = ProvisionReport::default();
        let mut init = |level: CaLevel| -> Result<CaInstance> {
            let ca = CaInstance::initialize(
                store.ca(level),
                engine,
                &config.passphrases.ca,
                &options,
                &registry,
            )?;
            report.record(format!("{}/ledger", level), &ca.store().index_path(), ca.ledger_reset());
            report.record(format!("{}/key", level), &ca.store().key_path(), ca.key_generated());
            Ok(ca)
        };
        let root = init(CaLevel::Root)?;
        let intermediate = init(CaLevel::Intermediate)?;

        Ok(Self {
            engine,
            config,
            store,
            root,
            intermediate,
            report,
            root_cert_produced: false,
            intermediate_cert_produced: false,
            signer2_issued: None,
            _stage: PhantomData,
        })
    }

    pub fn issue_root(mut self) -> Result<Hierarchy<'a, RootReady>> {
        let config = self.config;
        let ca_store = self.root.store().clone();
        let cert_path = ca_store.cert_path();

        if should_produce(&cert_path, self.issuer_forced(CaLevel::Root)) {
            let key = self.root.key()?;
            let subject = config.subject(CaLevel::Root.common_name());
            let issued = self.sign(
                CaLevel::Root,
                &key,
                &config.passphrases.ca,
                &subject,
                ExtensionProfile::RootCa,
                &config.validity.root,
                &ca_store.csr_path(),
                true,
            )?;
            issued.save(&cert_path)?;
            info!(serial = %format_serial(issued.serial), "root certificate self-signed");
            self.report.record_signed("root/certificate", &cert_path, issued.serial);
            self.root_cert_produced = true;
        } else {
            self.report.record("root/certificate", &cert_path, false);
        }

        Ok(self.advance())
    }
}

impl<'a> Hierarchy<'a, RootReady> {
    pub fn issue_intermediate(mut self) -> Result<Hierarchy<'a, IntermediateReady>> {
        let config = self.config;
        let ca_store = self.intermediate.store().clone();
        let cert_path = ca_store.cert_path();
        let force = self.issuer_forced(CaLevel::Root) || self.intermediate.key_generated();

        if should_produce(&cert_path, force) {
            let key = self.intermediate.key()?;
            let subject = config.subject(CaLevel::Intermediate.common_name());
            let issued = self.sign(
                CaLevel::Root,
                &key,
                &config.passphrases.ca,
                &subject,
                ExtensionProfile::SubordinateCa,
                &config.validity.intermediate,
                &ca_store.csr_path(),
                false,
            )?;
            issued.save(&cert_path)?;
            info!(serial = %format_serial(issued.serial), "intermediate certificate issued");
            self.report
                .record_signed("intermediate/certificate", &cert_path, issued.serial);
            self.intermediate_cert_produced = true;
        } else {
            self.report.record("intermediate/certificate", &cert_path, false);
        }

        let chain_path = ca_store.chain_path();
        let chain_stale = self.root_cert_produced || self.intermediate_cert_produced;
        let produce_chain = should_produce(&chain_path, chain_stale);
        if produce_chain {
            let chain = format!(
                "{}{}",
                self.intermediate.certificate_pem()?,
                self.root.certificate_pem()?
            );
            write_atomic(&chain_path, chain)?;
            debug!(path = %chain_path.display(), "chain bundle written");
        }
        self.report
            .record("intermediate/chain", &chain_path, produce_chain);

        Ok(self.advance())
    }
}

impl<'a> Hierarchy<'a, IntermediateReady> {
    /// Issues OCSP, TSA and both signers, each gated on its own certificate.
    pub fn issue_leaves(mut self) -> Result<Hierarchy<'a, LeavesIssued>> {
        for role in LeafRole::ALL {
            self.issue_leaf(role)?;
        }
        Ok(self.advance())
    }

    fn issue_leaf(&mut self, role: LeafRole) -> Result<()> {
        let engine = self.engine;
        let config = self.config;
        let passphrase = config.passphrases.leaf.as_str();
        let ca_store = self.ca(role.issuer()).store().clone();
        let registry = self.store.keys();

        let key_path = ca_store.leaf_key_path(role.name());
        let key_generated = should_produce(&key_path, config.force.keys());
        if key_generated {
            engine.generate_key(passphrase)?.save(&key_path)?;
            info!(role = %role, "leaf key generated");
        }
        registry.publish(role.name(), &key_path)?;
        self.report
            .record(format!("{}/key", role), &key_path, key_generated);

        let cert_path = ca_store.leaf_cert_path(role.name());
        let force = self.issuer_forced(role.issuer()) || key_generated;
        let cert_produced = should_produce(&cert_path, force);
        let key = KeyMaterial::load(&key_path)?;
        if cert_produced {
            let issued = self.sign(
                role.issuer(),
                &key,
                passphrase,
                &role.subject(config),
                role.profile(),
                role.validity(config),
                &ca_store.leaf_csr_path(role.name()),
                false,
            )?;
            issued.save(&cert_path)?;
            info!(
                role = %role,
                issuer = %role.issuer(),
                serial = %format_serial(issued.serial),
                "leaf certificate issued"
            );
            self.report
                .record_signed(format!("{}/certificate", role), &cert_path, issued.serial);
            if role == LeafRole::Signer2 {
                self.signer2_issued = Some(issued.serial);
            }
        } else {
            self.report
                .record(format!("{}/certificate", role), &cert_path, false);
        }

        if role.is_signer() {
            let bundle_path = ca_store.leaf_bundle_path(role.name());
            let chain_reissued = self.root_cert_produced || self.intermediate_cert_produced;
            let produce_bundle = should_produce(&bundle_path, cert_produced || chain_reissued);
            if produce_bundle {
                let cert = IssuedCertificate::load(&cert_path)?;
                let chain = [
                    self.intermediate.certificate_pem()?,
                    self.root.certificate_pem()?,
                ];
                let name = match role {
                    LeafRole::Signer1 => &config.signers.first.name,
                    _ => &config.signers.second.name,
                };
                engine
                    .export_bundle(
                        &cert,
                        &key,
                        passphrase,
                        &chain,
                        &config.passphrases.export,
                        name,
                    )?
                    .save(&bundle_path)?;
                debug!(role = %role, path = %bundle_path.display(), "PKCS#12 bundle written");
            }
            self.report
                .record(format!("{}/bundle", role), &bundle_path, produce_bundle);
        }

        Ok(())
    }
}

impl<'a> Hierarchy<'a, LeavesIssued> {
    /// Revokes the second signer, but only when it was issued in this run.
    pub fn apply_revocation(mut self) -> Result<Hierarchy<'a, Revoked>> {
        let index_path = self.intermediate.store().index_path();
        match self.signer2_issued {
            Some(serial) => {
                let applier = RevocationApplier::new(
                    self.config.revocation.at,
                    self.config.revocation.reason,
                );
                applier.apply(&mut self.intermediate, serial)?;
                self.report.record_signed("signer2/revocation", &index_path, serial);
                self.report.revoked_serial = Some(serial);
            }
            None => {
                debug!("signer2 certificate reused, revocation already recorded");
                self.report.record("signer2/revocation", &index_path, false);
            }
        }
        Ok(self.advance())
    }
}

impl<'a> Hierarchy<'a, Revoked> {
    /// Emits the intermediate CRL, then the root CRL, and finishes the run.
    pub fn emit_crls(mut self) -> Result<ProvisionReport> {
        let emitter = CrlEmitter::new(self.config.crl_days, self.config.force);
        let engine = self.engine;
        let config = self.config;
        let passphrase = config.passphrases.ca.as_str();

        for level in [CaLevel::Intermediate, CaLevel::Root] {
            let ca = self.ca_mut(level);
            let path = ca.store().crl_path();
            match emitter.emit(engine, ca, passphrase)? {
                Some(crl) => {
                    self.report
                        .record_signed(format!("{}/crl", level), &path, crl.number)
                }
                None => self.report.record(format!("{}/crl", level), &path, false),
            }
        }

        info!(
            produced = self.report.produced().count(),
            reused = self.report.reused().count(),
            "provisioning finished"
        );
        Ok(self.report)
    }
}

/// Runs every stage in order.
pub fn provision(engine: &dyn CryptoEngine, config: &FixtureConfig) -> Result<ProvisionReport> {
    Hierarchy::initialize(engine, config)?
        .issue_root()?
        .issue_intermediate()?
        .issue_leaves()?
        .apply_revocation()?
        .emit_crls()
}
