use chrono::{DateTime, Utc};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CustomExtension, DnType, DnValue,
    IsCa,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// PKCS#9 emailAddress attribute, still expected in the subject of S/MIME style signers.
const OID_EMAIL_ADDRESS: &[u64] = &[1, 2, 840, 113549, 1, 9, 1];

/// id-pkix-ocsp-nocheck (RFC 6960 4.2.2.2.1).
const OID_OCSP_NOCHECK: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 48, 1, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CertSigAlgo {
    Ed25519,
    EcdsaP256,
    EcdsaP384,
}

impl CertSigAlgo {
    pub fn to_rcgen(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            CertSigAlgo::Ed25519 => &rcgen::PKCS_ED25519,
            CertSigAlgo::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            CertSigAlgo::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        }
    }

    pub fn key_pair(&self) -> Result<rcgen::KeyPair, crate::Error> {
        rcgen::KeyPair::generate_for(self.to_rcgen())
            .map_err(|e| crate::Error::Engine(format!("key generation failed: {}", e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CertSigAlgo::Ed25519 => "ed25519",
            CertSigAlgo::EcdsaP256 => "ecdsa-p256",
            CertSigAlgo::EcdsaP384 => "ecdsa-p384",
        }
    }
}

impl std::str::FromStr for CertSigAlgo {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ed25519" => Ok(CertSigAlgo::Ed25519),
            "ecdsa-p256" | "ecdsap256" | "p256" => Ok(CertSigAlgo::EcdsaP256),
            "ecdsa-p384" | "ecdsap384" | "p384" => Ok(CertSigAlgo::EcdsaP384),
            _ => Err(crate::Error::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl TryFrom<String> for CertSigAlgo {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CertSigAlgo> for String {
    fn from(algo: CertSigAlgo) -> Self {
        algo.name().to_string()
    }
}

/// The two CA levels of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaLevel {
    Root,
    Intermediate,
}

impl CaLevel {
    /// Directory and file stem used for this level in the artifact store.
    pub fn as_str(&self) -> &'static str {
        match self {
            CaLevel::Root => "root",
            CaLevel::Intermediate => "intermediate",
        }
    }

    pub fn common_name(&self) -> &'static str {
        match self {
            CaLevel::Root => "Root CA",
            CaLevel::Intermediate => "Intermediate CA",
        }
    }
}

impl fmt::Display for CaLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CaLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "root" => Ok(CaLevel::Root),
            "intermediate" | "interm" => Ok(CaLevel::Intermediate),
            _ => Err(crate::Error::InvalidInput(format!("unknown CA level: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistinguishedName {
    pub common_name: String,
    pub organization: Option<String>,
    pub organizational_unit: Option<String>,
    pub country: Option<String>,
    pub state: Option<String>,
    pub locality: Option<String>,
    pub email: Option<String>,
}

impl DistinguishedName {
    pub fn new(cn: impl Into<String>) -> Self {
        Self {
            common_name: cn.into(),
            organization: None,
            organizational_unit: None,
            country: None,
            state: None,
            locality: None,
            email: None,
        }
    }

    pub fn with_organization(mut self, org: impl Into<String>) -> Self {
        self.organization = Some(org.into());
        self
    }

    pub fn with_organizational_unit(mut self, ou: impl Into<String>) -> Self {
        self.organizational_unit = Some(ou.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Builds the rcgen name in OpenSSL's conventional order (C, ST, L, O, OU, CN, emailAddress).
    pub fn to_rcgen(&self) -> Result<rcgen::DistinguishedName, crate::Error> {
        let mut dn = rcgen::DistinguishedName::new();

        if let Some(ref country) = self.country {
            dn.push(DnType::CountryName, country);
        }
        if let Some(ref state) = self.state {
            dn.push(DnType::StateOrProvinceName, state);
        }
        if let Some(ref locality) = self.locality {
            dn.push(DnType::LocalityName, locality);
        }
        if let Some(ref org) = self.organization {
            dn.push(DnType::OrganizationName, org);
        }
        if let Some(ref ou) = self.organizational_unit {
            dn.push(DnType::OrganizationalUnitName, ou);
        }
        dn.push(DnType::CommonName, &self.common_name);
        if let Some(ref email) = self.email {
            let value = Ia5String::try_from(email.clone())
                .map_err(|e| crate::Error::InvalidInput(format!("email {}: {}", email, e)))?;
            dn.push(
                DnType::CustomDnType(OID_EMAIL_ADDRESS.to_vec()),
                DnValue::Ia5String(value),
            );
        }

        Ok(dn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    DigitalSignature,
    KeyEncipherment,
    KeyCertSign,
    CrlSign,
    NonRepudiation,
}

impl KeyUsage {
    pub fn to_rcgen(&self) -> rcgen::KeyUsagePurpose {
        match self {
            KeyUsage::DigitalSignature => rcgen::KeyUsagePurpose::DigitalSignature,
            KeyUsage::KeyEncipherment => rcgen::KeyUsagePurpose::KeyEncipherment,
            KeyUsage::KeyCertSign => rcgen::KeyUsagePurpose::KeyCertSign,
            KeyUsage::CrlSign => rcgen::KeyUsagePurpose::CrlSign,
            KeyUsage::NonRepudiation => rcgen::KeyUsagePurpose::ContentCommitment,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedKeyUsage {
    ClientAuth,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

impl ExtendedKeyUsage {
    pub fn to_rcgen(&self) -> rcgen::ExtendedKeyUsagePurpose {
        match self {
            ExtendedKeyUsage::ClientAuth => rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsage::EmailProtection => rcgen::ExtendedKeyUsagePurpose::EmailProtection,
            ExtendedKeyUsage::TimeStamping => rcgen::ExtendedKeyUsagePurpose::TimeStamping,
            ExtendedKeyUsage::OcspSigning => rcgen::ExtendedKeyUsagePurpose::OcspSigning,
        }
    }
}

/// Extension set applied to a certificate according to its role in the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionProfile {
    RootCa,
    SubordinateCa,
    OcspResponder,
    TimeStamping,
    EndUser,
}

impl ExtensionProfile {
    pub fn is_ca(&self) -> bool {
        matches!(self, ExtensionProfile::RootCa | ExtensionProfile::SubordinateCa)
    }

    pub fn key_usage(&self) -> Vec<KeyUsage> {
        match self {
            ExtensionProfile::RootCa | ExtensionProfile::SubordinateCa => vec![
                KeyUsage::DigitalSignature,
                KeyUsage::KeyCertSign,
                KeyUsage::CrlSign,
            ],
            ExtensionProfile::OcspResponder => vec![KeyUsage::DigitalSignature],
            ExtensionProfile::TimeStamping => {
                vec![KeyUsage::DigitalSignature, KeyUsage::NonRepudiation]
            }
            ExtensionProfile::EndUser => vec![
                KeyUsage::DigitalSignature,
                KeyUsage::NonRepudiation,
                KeyUsage::KeyEncipherment,
            ],
        }
    }

    pub fn extended_key_usage(&self) -> Vec<ExtendedKeyUsage> {
        match self {
            ExtensionProfile::RootCa | ExtensionProfile::SubordinateCa => vec![],
            ExtensionProfile::OcspResponder => vec![ExtendedKeyUsage::OcspSigning],
            ExtensionProfile::TimeStamping => vec![ExtendedKeyUsage::TimeStamping],
            ExtensionProfile::EndUser => vec![
                ExtendedKeyUsage::EmailProtection,
                ExtendedKeyUsage::ClientAuth,
            ],
        }
    }

    /// Overwrites the CA constraints and usage extensions of `params` with this profile.
    pub fn apply(&self, params: &mut CertificateParams) {
        params.is_ca = match self {
            ExtensionProfile::RootCa => IsCa::Ca(BasicConstraints::Unconstrained),
            ExtensionProfile::SubordinateCa => IsCa::Ca(BasicConstraints::Constrained(0)),
            _ => IsCa::ExplicitNoCa,
        };
        params.key_usages = self.key_usage().iter().map(|ku| ku.to_rcgen()).collect();
        params.extended_key_usages = self
            .extended_key_usage()
            .iter()
            .map(|eku| eku.to_rcgen())
            .collect();
        params.use_authority_key_identifier_extension = !matches!(self, ExtensionProfile::RootCa);
        params.custom_extensions.clear();

        if let ExtensionProfile::OcspResponder = self {
            // Extension value is an ASN.1 NULL.
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(OID_OCSP_NOCHECK, vec![0x05, 0x00]));
        }
    }
}

/// Validity window of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl Validity {
    pub fn new(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        Self {
            not_before,
            not_after,
        }
    }

    pub fn is_well_formed(&self) -> bool {
        self.not_before < self.not_after
    }

    pub(crate) fn to_offset(
        &self,
    ) -> Result<(time::OffsetDateTime, time::OffsetDateTime), crate::Error> {
        Ok((to_offset(self.not_before)?, to_offset(self.not_after)?))
    }
}

pub(crate) fn to_offset(at: DateTime<Utc>) -> Result<time::OffsetDateTime, crate::Error> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| crate::Error::Engine(format!("Invalid timestamp: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RevocationReason {
    Unspecified,
    KeyCompromise,
    CACompromise,
    AffiliationChanged,
    Superseded,
    CessationOfOperation,
    CertificateHold,
    RemoveFromCRL,
}

impl RevocationReason {
    /// Name used in the revocation column of an OpenSSL index file.
    pub fn openssl_name(&self) -> &'static str {
        match self {
            RevocationReason::Unspecified => "unspecified",
            RevocationReason::KeyCompromise => "keyCompromise",
            RevocationReason::CACompromise => "CACompromise",
            RevocationReason::AffiliationChanged => "affiliationChanged",
            RevocationReason::Superseded => "superseded",
            RevocationReason::CessationOfOperation => "cessationOfOperation",
            RevocationReason::CertificateHold => "certificateHold",
            RevocationReason::RemoveFromCRL => "removeFromCRL",
        }
    }

    pub fn to_rcgen(&self) -> rcgen::RevocationReason {
        match self {
            RevocationReason::Unspecified => rcgen::RevocationReason::Unspecified,
            RevocationReason::KeyCompromise => rcgen::RevocationReason::KeyCompromise,
            RevocationReason::CACompromise => rcgen::RevocationReason::CaCompromise,
            RevocationReason::AffiliationChanged => rcgen::RevocationReason::AffiliationChanged,
            RevocationReason::Superseded => rcgen::RevocationReason::Superseded,
            RevocationReason::CessationOfOperation => {
                rcgen::RevocationReason::CessationOfOperation
            }
            RevocationReason::CertificateHold => rcgen::RevocationReason::CertificateHold,
            RevocationReason::RemoveFromCRL => rcgen::RevocationReason::RemoveFromCrl,
        }
    }
}

impl std::str::FromStr for RevocationReason {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "unspecified" => Ok(RevocationReason::Unspecified),
            "keycompromise" => Ok(RevocationReason::KeyCompromise),
            "cacompromise" => Ok(RevocationReason::CACompromise),
            "affiliationchanged" => Ok(RevocationReason::AffiliationChanged),
            "superseded" => Ok(RevocationReason::Superseded),
            "cessationofoperation" | "cessation" => Ok(RevocationReason::CessationOfOperation),
            "certificatehold" | "hold" => Ok(RevocationReason::CertificateHold),
            "removefromcrl" => Ok(RevocationReason::RemoveFromCRL),
            _ => Err(crate::Error::InvalidInput(format!(
                "Invalid revocation reason: {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for RevocationReason {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RevocationReason> for String {
    fn from(reason: RevocationReason) -> Self {
        reason.openssl_name().to_string()
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.openssl_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_parsing() {
        assert!(matches!("ed25519".parse::<CertSigAlgo>(), Ok(CertSigAlgo::Ed25519)));
        assert!(matches!("P256".parse::<CertSigAlgo>(), Ok(CertSigAlgo::EcdsaP256)));
        assert!(matches!("rsa4096".parse::<CertSigAlgo>(), Err(crate::Error::UnsupportedAlgorithm(_))));
    }

    #[test]
    fn test_revocation_reason_names() {
        for reason in [
            RevocationReason::Unspecified,
            RevocationReason::KeyCompromise,
            RevocationReason::CACompromise,
            RevocationReason::RemoveFromCRL,
        ] {
            assert_eq!(reason.openssl_name().parse::<RevocationReason>().unwrap(), reason);
        }
        assert_eq!(
            "key-compromise".parse::<RevocationReason>().unwrap(),
            RevocationReason::KeyCompromise
        );
    }

    #[test]
    fn test_profiles() {
        let mut params = CertificateParams::default();
        ExtensionProfile::SubordinateCa.apply(&mut params);
        assert_eq!(params.is_ca, IsCa::Ca(BasicConstraints::Constrained(0)));
        assert!(params.use_authority_key_identifier_extension);

        ExtensionProfile::OcspResponder.apply(&mut params);
        assert_eq!(params.is_ca, IsCa::ExplicitNoCa);
        assert_eq!(params.custom_extensions.len(), 1);
        assert_eq!(
            params.extended_key_usages,
            vec![rcgen::ExtendedKeyUsagePurpose::OcspSigning]
        );

        ExtensionProfile::TimeStamping.apply(&mut params);
        assert!(params.custom_extensions.is_empty());
        assert!(!ExtensionProfile::EndUser.is_ca());
    }

    #[test]
    fn test_dn_with_email() {
        let dn = DistinguishedName::new("Alice")
            .with_country("BE")
            .with_email("alice@example.com")
            .to_rcgen()
            .unwrap();
        assert!(dn.get(&DnType::CommonName).is_some());
        assert!(dn
            .get(&DnType::CustomDnType(OID_EMAIL_ADDRESS.to_vec()))
            .is_some());
    }
}
