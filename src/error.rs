use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Crypto engine error: {0}")]
    Engine(String),

    #[error("Key protection error: {0}")]
    KeyProtection(String),

    #[error("Missing passphrase: {0}")]
    MissingPassphrase(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Certificate parsing error: {0}")]
    CertParse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed ledger: {0}")]
    Ledger(String),

    #[error("Malformed counter file {path}: {reason}")]
    Counter { path: String, reason: String },

    #[error("Certificate not found: {0}")]
    NotFound(String),

    #[error("Certificate already revoked: serial {0}")]
    AlreadyRevoked(String),

    #[error("Invalid certificate chain: {0}")]
    InvalidChain(String),

    #[error("PKCS12 export error: {0}")]
    Pkcs12(String),

    #[error("PEM parsing error: {0}")]
    Pem(String),

    #[error("X509 parsing error: {0}")]
    X509Parse(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::Engine(err.to_string())
    }
}

impl From<x509_parser::error::X509Error> for Error {
    fn from(err: x509_parser::error::X509Error) -> Self {
        Error::X509Parse(err.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for Error {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        Error::X509Parse(err.to_string())
    }
}

impl From<pkcs8::Error> for Error {
    fn from(err: pkcs8::Error) -> Self {
        Error::KeyProtection(err.to_string())
    }
}

impl From<pem::PemError> for Error {
    fn from(err: pem::PemError) -> Self {
        Error::Pem(err.to_string())
    }
}

impl From<yasna::ASN1Error> for Error {
    fn from(err: yasna::ASN1Error) -> Self {
        Error::Pkcs12(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(feature = "json")]
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
