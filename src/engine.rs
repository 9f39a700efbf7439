//! The cryptographic engine behind the provisioning workflow.
//!
//! The workflow decides *what* to produce and *when*; everything that touches
//! key material or DER structures goes through [`CryptoEngine`].
//! [`RcgenEngine`] is the implementation used by the CLI and the tests.

use crate::ca::CaInstance;
use crate::error::{Error, Result};
use crate::inspect::{parse_pem_certificate, pem_to_der};
use crate::types::{to_offset, CertSigAlgo, DistinguishedName, ExtensionProfile, Validity};
use pkcs8::pkcs5::pbes2;
use pkcs8::{EncryptedPrivateKeyInfo, LineEnding, PrivateKeyInfo};
use rand_core::{OsRng, RngCore};
use rcgen::{
    string::Ia5String, CertificateParams, CertificateSigningRequestParams, CrlDistributionPoint,
    CertificateRevocationListParams as CrlParams, Issuer, KeyIdMethod, KeyPair, RevokedCertParams, SanType, SerialNumber,
};
use std::fs;
use std::path::Path;
use tracing::debug;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// A private key, always stored as passphrase protected PKCS#8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pem: String,
}

impl KeyMaterial {
    pub fn from_pem(pem: impl Into<String>) -> Self {
        Self { pem: pem.into() }
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_pem(fs::read_to_string(path)?))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::store::write_atomic(path.as_ref(), &self.pem)
    }
}

/// A PKCS#10 request in PEM form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub pem: String,
}

impl CertificateRequest {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::store::write_atomic(path.as_ref(), &self.pem)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub pem: String,
    pub serial: u64,
}

impl IssuedCertificate {
    /// Reads a certificate back from disk, recovering its serial.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = fs::read_to_string(path)?;
        let serial = parse_pem_certificate(&pem)?.serial.ok_or_else(|| {
            Error::CertParse(format!("{}: serial exceeds 64 bits", path.display()))
        })?;
        Ok(Self { pem, serial })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::store::write_atomic(path.as_ref(), &self.pem)
    }
}

/// PKCS#12 archive with a certificate, its key and the issuer chain.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    der: Vec<u8>,
}

impl CertificateBundle {
    pub fn from_der(der: Vec<u8>) -> Self {
        Self { der }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::store::write_atomic(path.as_ref(), &self.der)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_der(fs::read(path)?))
    }

    /// DER certificates inside the bundle. Fails when the MAC does not verify
    /// under `password`.
    pub fn certificates(&self, password: &str) -> Result<Vec<Vec<u8>>> {
        let pfx = p12::PFX::parse(&self.der)?;
        if !pfx.verify_mac(password) {
            return Err(Error::Pkcs12("MAC verification failed".to_string()));
        }
        Ok(pfx.cert_x509_bags(password)?)
    }

    pub fn keys(&self, password: &str) -> Result<Vec<Vec<u8>>> {
        let pfx = p12::PFX::parse(&self.der)?;
        Ok(pfx.key_bags(password)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crl {
    pub pem: String,
    pub number: u64,
}

impl Crl {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::store::write_atomic(path.as_ref(), &self.pem)
    }
}

pub trait CryptoEngine {
    fn generate_key(&self, passphrase: &str) -> Result<KeyMaterial>;

    fn create_csr(
        &self,
        key: &KeyMaterial,
        passphrase: &str,
        subject: &DistinguishedName,
    ) -> Result<CertificateRequest>;

    /// Signs `csr` with `issuer`'s key, consuming its next serial and
    /// appending the ledger entry.
    fn sign_certificate(
        &self,
        issuer: &mut CaInstance,
        csr: &CertificateRequest,
        profile: ExtensionProfile,
        validity: &Validity,
        passphrase: &str,
    ) -> Result<IssuedCertificate>;

    /// Self-signs `csr` with `root`'s own key; the certificate is recorded in
    /// the root ledger like any other issuance.
    fn self_sign_certificate(
        &self,
        root: &mut CaInstance,
        csr: &CertificateRequest,
        profile: ExtensionProfile,
        validity: &Validity,
        passphrase: &str,
    ) -> Result<IssuedCertificate>;

    fn export_bundle(
        &self,
        cert: &IssuedCertificate,
        key: &KeyMaterial,
        key_passphrase: &str,
        chain: &[String],
        export_passphrase: &str,
        friendly_name: &str,
    ) -> Result<CertificateBundle>;

    /// Signs a CRL over the revoked entries of `instance`'s ledger and
    /// advances its CRL number.
    fn generate_crl(
        &self,
        instance: &mut CaInstance,
        validity_days: u32,
        passphrase: &str,
    ) -> Result<Crl>;
}

/// [`CryptoEngine`] backed by `rcgen`, `pkcs8` and `p12`.
#[derive(Debug, Clone)]
pub struct RcgenEngine {
    algorithm: CertSigAlgo,
    kdf_iterations: u32,
}

impl Default for RcgenEngine {
    fn default() -> Self {
        Self::new(CertSigAlgo::EcdsaP256)
    }
}

impl RcgenEngine {
    pub const DEFAULT_KDF_ITERATIONS: u32 = 2048;

    pub fn new(algorithm: CertSigAlgo) -> Self {
        Self {
            algorithm,
            kdf_iterations: Self::DEFAULT_KDF_ITERATIONS,
        }
    }

    pub fn with_kdf_iterations(mut self, iterations: u32) -> Self {
        self.kdf_iterations = iterations;
        self
    }

    fn protect(&self, key_pair: &KeyPair, passphrase: &str) -> Result<KeyMaterial> {
        require_passphrase(passphrase, "private key")?;

        let mut salt = [0u8; 16];
        let mut iv = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);
        let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(self.kdf_iterations, &salt, &iv)
            .map_err(|e| Error::KeyProtection(e.to_string()))?;

        let der = key_pair.serialize_der();
        let info = PrivateKeyInfo::try_from(der.as_slice())
            .map_err(|e| Error::KeyProtection(format!("unreadable PKCS#8 key: {}", e)))?;
        let encrypted = info.encrypt_with_params(params, passphrase)?;
        let pem = encrypted
            .to_pem(ENCRYPTED_KEY_LABEL, LineEnding::LF)
            .map_err(|e| Error::KeyProtection(e.to_string()))?;

        Ok(KeyMaterial::from_pem(pem.as_str()))
    }

    fn unlock(&self, key: &KeyMaterial, passphrase: &str) -> Result<KeyPair> {
        require_passphrase(passphrase, "private key")?;

        let block = pem::parse(key.pem())?;
        if block.tag() != ENCRYPTED_KEY_LABEL {
            return Err(Error::KeyProtection(format!(
                "expected {}, found {}",
                ENCRYPTED_KEY_LABEL,
                block.tag()
            )));
        }
        let info = EncryptedPrivateKeyInfo::try_from(block.contents())
            .map_err(|e| Error::KeyProtection(e.to_string()))?;
        let plain = info.decrypt(passphrase).map_err(|e| {
            Error::KeyProtection(format!("cannot decrypt private key (wrong passphrase?): {}", e))
        })?;

        let plain_pem = pem::encode(&pem::Pem::new("PRIVATE KEY", plain.as_bytes().to_vec()));
        KeyPair::from_pem(&plain_pem)
            .map_err(|e| Error::KeyProtection(format!("decrypted key is unusable: {}", e)))
    }

    /// Serial, validity, extensions and CRL pointer shared by every issuance.
    fn prepare(
        &self,
        params: &mut CertificateParams,
        serial: u64,
        profile: ExtensionProfile,
        validity: &Validity,
        crl_url: Option<&str>,
    ) -> Result<()> {
        let (not_before, not_after) = validity.to_offset()?;
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(SerialNumber::from_slice(&serial_to_bytes(serial)));
        profile.apply(params);
        params.crl_distribution_points = match crl_url {
            Some(url) => vec![CrlDistributionPoint {
                uris: vec![url.to_string()],
            }],
            None => Vec::new(),
        };
        Ok(())
    }
}

impl CryptoEngine for RcgenEngine {
    fn generate_key(&self, passphrase: &str) -> Result<KeyMaterial> {
        let key_pair = self.algorithm.key_pair()?;
        self.protect(&key_pair, passphrase)
    }

    fn create_csr(
        &self,
        key: &KeyMaterial,
        passphrase: &str,
        subject: &DistinguishedName,
    ) -> Result<CertificateRequest> {
        let key_pair = self.unlock(key, passphrase)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject.to_rcgen()?;
        if let Some(ref email) = subject.email {
            let value = Ia5String::try_from(email.clone())
                .map_err(|e| Error::InvalidInput(format!("email {}: {}", email, e)))?;
            params.subject_alt_names = vec![SanType::Rfc822Name(value)];
        }

        let csr = params.serialize_request(&key_pair)?;
        Ok(CertificateRequest {
            pem: pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", csr.der().to_vec())),
        })
    }

    fn sign_certificate(
        &self,
        issuer: &mut CaInstance,
        csr: &CertificateRequest,
        profile: ExtensionProfile,
        validity: &Validity,
        passphrase: &str,
    ) -> Result<IssuedCertificate> {
        let issuer_key = self.unlock(&issuer.key()?, passphrase)?;
        let signer = Issuer::from_ca_cert_pem(&issuer.certificate_pem()?, issuer_key)?;

        let mut request = CertificateSigningRequestParams::from_pem(&csr.pem)?;
        let serial = issuer.next_serial();
        self.prepare(
            &mut request.params,
            serial,
            profile,
            validity,
            issuer.crl_url(),
        )?;

        let certificate = request.signed_by(&signer)?;
        let issued = IssuedCertificate {
            pem: certificate.pem(),
            serial,
        };
        issuer.record_issuance(&issued)?;
        debug!(ca = %issuer.level(), serial, "certificate signed");
        Ok(issued)
    }

    fn self_sign_certificate(
        &self,
        root: &mut CaInstance,
        csr: &CertificateRequest,
        profile: ExtensionProfile,
        validity: &Validity,
        passphrase: &str,
    ) -> Result<IssuedCertificate> {
        let key_pair = self.unlock(&root.key()?, passphrase)?;

        let mut request = CertificateSigningRequestParams::from_pem(&csr.pem)?;
        let serial = root.next_serial();
        self.prepare(&mut request.params, serial, profile, validity, None)?;

        let certificate = request.params.self_signed(&key_pair)?;
        let issued = IssuedCertificate {
            pem: certificate.pem(),
            serial,
        };
        root.record_issuance(&issued)?;
        debug!(ca = %root.level(), serial, "certificate self-signed");
        Ok(issued)
    }

    fn export_bundle(
        &self,
        cert: &IssuedCertificate,
        key: &KeyMaterial,
        key_passphrase: &str,
        chain: &[String],
        export_passphrase: &str,
        friendly_name: &str,
    ) -> Result<CertificateBundle> {
        require_passphrase(export_passphrase, "PKCS#12 export")?;
        let key_der = self.unlock(key, key_passphrase)?.serialize_der();
        let cert_der = pem_to_der(&cert.pem)?;

        let mut chain_der = Vec::new();
        for cert_pem in chain {
            chain_der.push(pem_to_der(cert_pem)?);
        }
        let cas: Vec<&[u8]> = chain_der.iter().map(|der| der.as_slice()).collect();

        let pfx = p12::PFX::new_with_cas(&cert_der, &key_der, &cas, export_passphrase, friendly_name)
            .ok_or_else(|| Error::Pkcs12(format!("cannot assemble bundle for {}", friendly_name)))?;

        Ok(CertificateBundle::from_der(pfx.to_der()))
    }

    fn generate_crl(
        &self,
        instance: &mut CaInstance,
        validity_days: u32,
        passphrase: &str,
    ) -> Result<Crl> {
        let key_pair = self.unlock(&instance.key()?, passphrase)?;
        let signer = Issuer::from_ca_cert_pem(&instance.certificate_pem()?, key_pair)?;

        let mut revoked_certs = Vec::new();
        for entry in instance.ledger().revoked() {
            let revocation = entry.revocation.ok_or_else(|| {
                Error::Ledger(format!("serial {} revoked without a date", entry.serial_hex()))
            })?;
            revoked_certs.push(RevokedCertParams {
                serial_number: SerialNumber::from_slice(&serial_to_bytes(entry.serial)),
                revocation_time: to_offset(revocation.at)?,
                reason_code: revocation.reason.map(|r| r.to_rcgen()),
                invalidity_date: None,
            });
        }

        let number = instance.next_crl_number();
        let this_update = to_offset(chrono::Utc::now())?;
        let next_update = this_update
            .checked_add(time::Duration::days(i64::from(validity_days)))
            .ok_or_else(|| {
                Error::Config(format!("crl_days {} is out of range", validity_days))
            })?;
        let params = CrlParams {
            this_update,
            next_update,
            crl_number: SerialNumber::from_slice(&serial_to_bytes(number)),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };

        let crl = params.signed_by(&signer)?;
        instance.commit_crl_number(number)?;

        Ok(Crl {
            pem: pem::encode(&pem::Pem::new("X509 CRL", crl.der().to_vec())),
            number,
        })
    }
}

fn require_passphrase(passphrase: &str, purpose: &str) -> Result<()> {
    if passphrase.is_empty() {
        Err(Error::MissingPassphrase(purpose.to_string()))
    } else {
        Ok(())
    }
}

/// Minimal big-endian encoding of a positive serial (DER INTEGER contents).
pub fn serial_to_bytes(serial: u64) -> Vec<u8> {
    let bytes = serial.to_be_bytes();
    let start = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len() - 1);
    let mut out = bytes[start..].to_vec();
    if out[0] & 0x80 != 0 {
        out.insert(0, 0);
    }
    out
}
