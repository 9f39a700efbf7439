use crate::error::{Error, Result};
use crate::hierarchy::LeafRole;
use crate::ledger::Ledger;
use crate::store::ArtifactStore;
use crate::types::CaLevel;
use chrono::{DateTime, TimeZone, Utc};
use colored::Colorize;
use serde::Serialize;
use x509_parser::prelude::*;

#[derive(Debug, Clone, Serialize)]
pub struct CertificateChainInfo {
    pub certificates: Vec<ParsedCertificate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedCertificate {
    pub subject: String,
    /// Subject in the `/C=../O=../CN=..` form used by the issuance ledger.
    #[serde(skip)]
    pub subject_slashed: String,
    pub issuer: String,
    pub serial_number: String,
    #[serde(skip)]
    pub serial: Option<u64>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub signature_algorithm: String,
    pub subject_alt_names: Vec<String>,
    pub is_ca: bool,
    pub path_len: Option<u32>,
    pub key_usage: Vec<String>,
    pub extended_key_usage: Vec<String>,
    pub crl_distribution_points: Vec<String>,
    pub ocsp_no_check: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParsedCrl {
    pub issuer: String,
    pub crl_number: Option<u64>,
    pub this_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    pub revoked: Vec<RevokedEntry>,
}

impl ParsedCrl {
    pub fn lists(&self, serial: u64) -> bool {
        self.revoked.iter().any(|r| r.serial == serial)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RevokedEntry {
    pub serial: u64,
    pub revoked_at: DateTime<Utc>,
    pub reason_code: Option<u8>,
}

pub fn parse_certificate(cert_der: &[u8]) -> Result<ParsedCertificate> {
    let (_, x509) = X509Certificate::from_der(cert_der)
        .map_err(|e| Error::CertParse(format!("Failed to parse certificate: {}", e)))?;

    let subject = format_dn(&x509.subject);
    let subject_slashed = slashed_dn(&x509.subject);
    let issuer = format_dn(&x509.issuer);
    let serial_number = format_serial(x509.raw_serial());
    let serial = serial_from_bytes(x509.raw_serial());

    let not_before = to_utc(x509.validity.not_before.timestamp())?;
    let not_after = to_utc(x509.validity.not_after.timestamp())?;

    let signature_algorithm = match x509.signature_algorithm.algorithm.to_id_string().as_str() {
        "1.2.840.10045.4.3.2" => "ecdsa-with-SHA256".to_string(),
        "1.2.840.10045.4.3.3" => "ecdsa-with-SHA384".to_string(),
        "1.3.101.112" => "Ed25519".to_string(),
        other => other.to_string(),
    };

    let mut subject_alt_names = Vec::new();
    if let Ok(Some(san_ext)) = x509.subject_alternative_name() {
        for san in &san_ext.value.general_names {
            match san {
                GeneralName::DNSName(name) => {
                    subject_alt_names.push(format!("DNS:{}", name));
                }
                GeneralName::RFC822Name(email) => {
                    subject_alt_names.push(format!("Email:{}", email));
                }
                GeneralName::URI(uri) => {
                    subject_alt_names.push(format!("URI:{}", uri));
                }
                _ => {}
            }
        }
    }

    let (is_ca, path_len) = x509
        .basic_constraints()
        .ok()
        .flatten()
        .map(|bc| (bc.value.ca, bc.value.path_len_constraint))
        .unwrap_or((false, None));

    let mut key_usage = Vec::new();
    if let Ok(Some(ku_ext)) = x509.key_usage() {
        let ku = &ku_ext.value;
        if ku.digital_signature() {
            key_usage.push("Digital Signature".to_string());
        }
        if ku.non_repudiation() {
            key_usage.push("Non Repudiation".to_string());
        }
        if ku.key_encipherment() {
            key_usage.push("Key Encipherment".to_string());
        }
        if ku.key_cert_sign() {
            key_usage.push("Certificate Sign".to_string());
        }
        if ku.crl_sign() {
            key_usage.push("CRL Sign".to_string());
        }
    }

    let mut extended_key_usage = Vec::new();
    if let Ok(Some(eku_ext)) = x509.extended_key_usage() {
        let eku = &eku_ext.value;
        if eku.client_auth {
            extended_key_usage.push("TLS Web Client Authentication".to_string());
        }
        if eku.email_protection {
            extended_key_usage.push("Email Protection".to_string());
        }
        if eku.time_stamping {
            extended_key_usage.push("Time Stamping".to_string());
        }
        if eku.ocsp_signing {
            extended_key_usage.push("OCSP Signing".to_string());
        }
    }

    let mut crl_distribution_points = Vec::new();
    let mut ocsp_no_check = false;
    for ext in x509.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::CRLDistributionPoints(points) => {
                for point in points.points.iter() {
                    if let Some(DistributionPointName::FullName(names)) = &point.distribution_point
                    {
                        for name in names {
                            if let GeneralName::URI(uri) = name {
                                crl_distribution_points.push(uri.to_string());
                            }
                        }
                    }
                }
            }
            _ => {
                if ext.oid.to_id_string() == "1.3.6.1.5.5.7.48.1.5" {
                    ocsp_no_check = true;
                }
            }
        }
    }

    Ok(ParsedCertificate {
        subject,
        subject_slashed,
        issuer,
        serial_number,
        serial,
        not_before,
        not_after,
        signature_algorithm,
        subject_alt_names,
        is_ca,
        path_len,
        key_usage,
        extended_key_usage,
        crl_distribution_points,
        ocsp_no_check,
    })
}

pub fn parse_pem_certificate(pem_text: &str) -> Result<ParsedCertificate> {
    parse_certificate(&pem_to_der(pem_text)?)
}

/// Parses every `CERTIFICATE` block of a PEM file, leaf first as written.
pub fn parse_chain(pem_text: &str) -> Result<CertificateChainInfo> {
    let certificates = split_pem_chain(pem_text)?
        .iter()
        .map(|der| parse_certificate(der))
        .collect::<Result<Vec<_>>>()?;
    if certificates.is_empty() {
        return Err(Error::NotFound("No certificates in input".to_string()));
    }
    Ok(CertificateChainInfo { certificates })
}

pub fn parse_crl_pem(pem_text: &str) -> Result<ParsedCrl> {
    let der = pem_to_der(pem_text)?;
    let (_, crl) = x509_parser::parse_x509_crl(&der)
        .map_err(|e| Error::CertParse(format!("Failed to parse CRL: {}", e)))?;

    let mut revoked = Vec::new();
    for entry in crl.iter_revoked_certificates() {
        let serial = serial_from_bytes(entry.raw_serial()).ok_or_else(|| {
            Error::CertParse(format!(
                "CRL serial {} exceeds 64 bits",
                format_serial(entry.raw_serial())
            ))
        })?;
        revoked.push(RevokedEntry {
            serial,
            revoked_at: to_utc(entry.revocation_date.timestamp())?,
            reason_code: entry.reason_code().map(|(_, code)| code.0),
        });
    }

    Ok(ParsedCrl {
        issuer: format_dn(crl.issuer()),
        crl_number: crl
            .crl_number()
            .and_then(|n| serial_from_bytes(&n.to_bytes_be())),
        this_update: to_utc(crl.last_update().timestamp())?,
        next_update: crl
            .next_update()
            .map(|t| to_utc(t.timestamp()))
            .transpose()?,
        revoked,
    })
}

/// Checks that `child_pem` names `issuer_pem`'s subject as issuer and carries
/// a signature made with the issuer's key.
pub fn verify_issued_by(child_pem: &str, issuer_pem: &str) -> Result<()> {
    let child_der = pem_to_der(child_pem)?;
    let issuer_der = pem_to_der(issuer_pem)?;
    let (_, child) = X509Certificate::from_der(&child_der)?;
    let (_, issuer) = X509Certificate::from_der(&issuer_der)?;

    if child.issuer.as_raw() != issuer.subject.as_raw() {
        return Err(Error::InvalidChain(format!(
            "{} was issued by {}, not {}",
            format_dn(&child.subject),
            format_dn(&child.issuer),
            format_dn(&issuer.subject)
        )));
    }

    child
        .verify_signature(Some(issuer.public_key()))
        .map_err(|e| {
            Error::InvalidChain(format!(
                "signature of {} does not verify under {}: {}",
                format_dn(&child.subject),
                format_dn(&issuer.subject),
                e
            ))
        })
}

/// Verifies a leaf-first chain whose last element is the self-signed anchor.
pub fn verify_chain(pems: &[String]) -> Result<()> {
    let anchor = pems
        .last()
        .ok_or_else(|| Error::InvalidChain("empty chain".to_string()))?;
    verify_issued_by(anchor, anchor)?;
    for pair in pems.windows(2) {
        verify_issued_by(&pair[0], &pair[1])?;
    }
    Ok(())
}

/// Re-checks a provisioned store: every certificate against its issuer, the
/// chain file, and that each CRL lists exactly the revoked ledger serials.
/// Returns one line per passed check.
pub fn verify_store(store: &ArtifactStore) -> Result<Vec<String>> {
    let mut passed = Vec::new();
    let root_store = store.ca(CaLevel::Root);
    let interm_store = store.ca(CaLevel::Intermediate);
    let root = std::fs::read_to_string(root_store.cert_path())?;
    let intermediate = std::fs::read_to_string(interm_store.cert_path())?;

    verify_issued_by(&root, &root)?;
    passed.push("root certificate is self-signed".to_string());
    verify_issued_by(&intermediate, &root)?;
    passed.push("intermediate certificate issued by root".to_string());

    let chain = split_pem_certificates(&std::fs::read_to_string(interm_store.chain_path())?)?;
    if chain.len() != 2 || pem_to_der(&chain[0])? != pem_to_der(&intermediate)? {
        return Err(Error::InvalidChain(format!(
            "{} does not start with the intermediate certificate",
            interm_store.chain_path().display()
        )));
    }
    verify_chain(&chain)?;
    passed.push("chain file verifies against root".to_string());

    for role in LeafRole::ALL {
        let issuer = match role.issuer() {
            CaLevel::Root => &root,
            CaLevel::Intermediate => &intermediate,
        };
        let leaf_path = store.ca(role.issuer()).leaf_cert_path(role.name());
        verify_issued_by(&std::fs::read_to_string(&leaf_path)?, issuer)?;
        passed.push(format!("{} certificate issued by {}", role, role.issuer()));
    }

    for (level, ca_pem) in [(CaLevel::Intermediate, &intermediate), (CaLevel::Root, &root)] {
        let ca_store = store.ca(level);
        let ledger = Ledger::parse(&std::fs::read_to_string(ca_store.index_path())?)?;
        let crl = parse_crl_pem(&std::fs::read_to_string(ca_store.crl_path())?)?;

        if crl.issuer != parse_pem_certificate(ca_pem)?.subject {
            return Err(Error::InvalidChain(format!(
                "{} CRL issued by {}",
                level, crl.issuer
            )));
        }
        let mut expected: Vec<u64> = ledger.revoked().map(|e| e.serial).collect();
        let mut listed: Vec<u64> = crl.revoked.iter().map(|r| r.serial).collect();
        expected.sort_unstable();
        listed.sort_unstable();
        if expected != listed {
            return Err(Error::InvalidChain(format!(
                "{} CRL lists {:?}, ledger has {:?} revoked",
                level, listed, expected
            )));
        }
        passed.push(format!(
            "{} CRL matches ledger ({} revoked)",
            level,
            listed.len()
        ));
    }

    Ok(passed)
}

pub fn pem_to_der(pem_text: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_text)?;
    Ok(block.contents().to_vec())
}

/// Splits a concatenated PEM file into DER certificates.
pub fn split_pem_chain(pem_text: &str) -> Result<Vec<Vec<u8>>> {
    Ok(::pem::parse_many(pem_text)?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.contents().to_vec())
        .collect())
}

/// Splits a concatenated PEM file into individual PEM certificates.
pub fn split_pem_certificates(pem_text: &str) -> Result<Vec<String>> {
    Ok(split_pem_chain(pem_text)?
        .into_iter()
        .map(|der| ::pem::encode(&::pem::Pem::new("CERTIFICATE", der)))
        .collect())
}

fn dn_attributes<'a>(dn: &'a X509Name<'a>) -> Vec<(&'static str, &'a str)> {
    let mut parts = Vec::new();

    for rdn in dn.iter() {
        for attr in rdn.iter() {
            let attr_value = attr.attr_value().as_str().unwrap_or("?");

            let name = match attr.attr_type().to_id_string().as_str() {
                "2.5.4.3" => "CN",
                "2.5.4.10" => "O",
                "2.5.4.11" => "OU",
                "2.5.4.6" => "C",
                "2.5.4.7" => "L",
                "2.5.4.8" => "ST",
                "1.2.840.113549.1.9.1" => "emailAddress",
                _ => continue,
            };

            parts.push((name, attr_value));
        }
    }

    parts
}

fn format_dn(dn: &X509Name) -> String {
    dn_attributes(dn)
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `/`-separated form of `dn`. A `/` or `\` inside a value is backslash-escaped.
fn slashed_dn(dn: &X509Name) -> String {
    dn_attributes(dn)
        .iter()
        .map(|(name, value)| {
            let escaped = value.replace('\\', "\\\\").replace('/', "\\/");
            format!("/{}={}", name, escaped)
        })
        .collect()
}

fn format_serial(serial: &[u8]) -> String {
    serial
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Big-endian unsigned integer bytes to `u64`, ignoring leading zero bytes.
pub fn serial_from_bytes(bytes: &[u8]) -> Option<u64> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    let significant = &bytes[start..];
    if significant.len() > 8 {
        return None;
    }
    Some(
        significant
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
    )
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| Error::CertParse(format!("timestamp out of range: {}", timestamp)))
}

pub fn display_certificate_chain(
    chain: &CertificateChainInfo,
    format: OutputFormat,
) -> Result<String> {
    match format {
        OutputFormat::Pretty => Ok(display_pretty(chain)),
        #[cfg(feature = "json")]
        OutputFormat::Json => Ok(serde_json::to_string_pretty(chain)?),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pretty,
    #[cfg(feature = "json")]
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            #[cfg(feature = "json")]
            "json" => Ok(OutputFormat::Json),
            _ => Err(Error::InvalidInput(format!("Invalid format: {}", s))),
        }
    }
}

fn display_pretty(chain: &CertificateChainInfo) -> String {
    let mut output = String::new();

    output.push_str(&format!("\n{}\n", "Certificate Chain".bold().cyan()));
    output.push_str(&format!("{}\n\n", "=".repeat(80)));

    let now = Utc::now();
    for (idx, cert) in chain.certificates.iter().enumerate() {
        output.push_str(&format!(
            "{} {}\n",
            "Certificate".bold(),
            format!("[{}]", idx).dimmed()
        ));
        output.push_str(&format!("{}\n", "-".repeat(80)));

        output.push_str(&format!("  {}: {}\n", "Subject".bold().yellow(), cert.subject));
        output.push_str(&format!("  {}: {}\n", "Issuer".bold().yellow(), cert.issuer));
        output.push_str(&format!(
            "  {}: {}\n",
            "Serial Number".bold().yellow(),
            cert.serial_number
        ));

        let status = if now < cert.not_before {
            "Not yet valid".yellow()
        } else if now > cert.not_after {
            "Expired".red()
        } else {
            "Valid".green()
        };
        output.push_str(&format!("  {}: {}\n", "Validity Status".bold().yellow(), status));
        output.push_str(&format!(
            "  {}: {}\n",
            "Not Before".bold().yellow(),
            cert.not_before.to_rfc3339().dimmed()
        ));
        output.push_str(&format!(
            "  {}: {}\n",
            "Not After".bold().yellow(),
            cert.not_after.to_rfc3339().dimmed()
        ));
        output.push_str(&format!(
            "  {}: {}\n",
            "Signature Algorithm".bold().yellow(),
            cert.signature_algorithm.dimmed()
        ));

        if cert.is_ca {
            let constraint = match cert.path_len {
                Some(len) => format!("Yes (pathlen {})", len),
                None => "Yes".to_string(),
            };
            output.push_str(&format!(
                "  {}: {}\n",
                "CA Certificate".bold().yellow(),
                constraint.green()
            ));
        }

        if !cert.subject_alt_names.is_empty() {
            output.push_str(&format!("  {}:\n", "Subject Alternative Names".bold().yellow()));
            for san in &cert.subject_alt_names {
                output.push_str(&format!("    - {}\n", san.cyan()));
            }
        }

        if !cert.key_usage.is_empty() {
            output.push_str(&format!(
                "  {}: {}\n",
                "Key Usage".bold().yellow(),
                cert.key_usage.join(", ").dimmed()
            ));
        }

        if !cert.extended_key_usage.is_empty() {
            output.push_str(&format!(
                "  {}: {}\n",
                "Extended Key Usage".bold().yellow(),
                cert.extended_key_usage.join(", ").dimmed()
            ));
        }

        if !cert.crl_distribution_points.is_empty() {
            output.push_str(&format!(
                "  {}: {}\n",
                "CRL Distribution Points".bold().yellow(),
                cert.crl_distribution_points.join(", ").dimmed()
            ));
        }

        if cert.ocsp_no_check {
            output.push_str(&format!("  {}: {}\n", "OCSP No Check".bold().yellow(), "Yes".dimmed()));
        }

        output.push('\n');
    }

    output.push_str(&format!("{}\n", "=".repeat(80)));
    output.push_str(&format!(
        "{}: {}\n",
        "Total Certificates".bold().cyan(),
        chain.certificates.len()
    ));

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_from_bytes() {
        assert_eq!(serial_from_bytes(&[0x10, 0x00]), Some(0x1000));
        assert_eq!(serial_from_bytes(&[0x00, 0x00, 0x80]), Some(0x80));
        assert_eq!(serial_from_bytes(&[]), Some(0));
        assert_eq!(serial_from_bytes(&[1; 9]), None);
    }

    fn self_signed_with(organization: &str, common_name: &str) -> String {
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CountryName, "BE");
        params
            .distinguished_name
            .push(rcgen::DnType::OrganizationName, organization);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        let key = rcgen::KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn test_slashed_subject() {
        let parsed = parse_pem_certificate(&self_signed_with("Example Inc", "Root CA")).unwrap();
        assert_eq!(parsed.subject_slashed, "/C=BE/O=Example Inc/CN=Root CA");
    }

    #[test]
    fn test_slashed_subject_keeps_commas_and_escapes_slashes() {
        let parsed =
            parse_pem_certificate(&self_signed_with("Example, Inc.", "Root/Test CA")).unwrap();
        assert_eq!(parsed.subject, "C=BE, O=Example, Inc., CN=Root/Test CA");
        assert_eq!(
            parsed.subject_slashed,
            "/C=BE/O=Example, Inc./CN=Root\\/Test CA"
        );
    }

    #[test]
    fn test_format_serial() {
        assert_eq!(format_serial(&[0x10, 0x01]), "10:01");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_chain("not a pem").is_err());
        assert!(parse_pem_certificate("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").is_err());
    }
}
