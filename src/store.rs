//! On-disk layout of the fixture PKI.

use crate::error::{Error, Result};
use crate::ledger::{format_serial, parse_serial};
use crate::types::CaLevel;
use std::fs;
use std::path::{Path, PathBuf};

/// Root of the artifact store (`base_dir` in the configuration).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn ca(&self, level: CaLevel) -> CaStore {
        CaStore {
            level,
            dir: self.base.join(level.as_str()),
        }
    }

    pub fn keys(&self) -> KeyRegistry {
        KeyRegistry {
            dir: self.base.join("keys"),
        }
    }
}

/// Files belonging to one CA instance.
#[derive(Debug, Clone)]
pub struct CaStore {
    level: CaLevel,
    dir: PathBuf,
}

impl CaStore {
    pub fn level(&self) -> CaLevel {
        self.level
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join("ca.key.pem")
    }

    pub fn csr_path(&self) -> PathBuf {
        self.dir.join("ca.csr.pem")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join("ca.cert.pem")
    }

    pub fn chain_path(&self) -> PathBuf {
        self.dir.join("ca-chain.cert.pem")
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join("index.txt")
    }

    pub fn serial_path(&self) -> PathBuf {
        self.dir.join("serial")
    }

    pub fn crl_number_path(&self) -> PathBuf {
        self.dir.join("crlnumber")
    }

    pub fn newcerts_dir(&self) -> PathBuf {
        self.dir.join("newcerts")
    }

    pub fn newcert_path(&self, serial: u64) -> PathBuf {
        self.newcerts_dir()
            .join(format!("{}.pem", format_serial(serial)))
    }

    pub fn crl_path(&self) -> PathBuf {
        self.dir
            .join("crl")
            .join(format!("{}.crl.pem", self.level.as_str()))
    }

    pub fn issued_dir(&self) -> PathBuf {
        self.dir.join("issued")
    }

    pub fn leaf_cert_path(&self, role: &str) -> PathBuf {
        self.issued_dir().join(format!("{}.cert.pem", role))
    }

    pub fn leaf_key_path(&self, role: &str) -> PathBuf {
        self.issued_dir().join(format!("{}.key.pem", role))
    }

    pub fn leaf_csr_path(&self, role: &str) -> PathBuf {
        self.issued_dir().join(format!("{}.csr.pem", role))
    }

    pub fn leaf_bundle_path(&self, role: &str) -> PathBuf {
        self.issued_dir().join(format!("{}.p12", role))
    }

    /// Creates the instance directory and its sub-directories.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.dir.clone(),
            self.newcerts_dir(),
            self.dir.join("crl"),
            self.issued_dir(),
        ] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("creating {}: {}", dir.display(), e),
                ))
            })?;
        }
        Ok(())
    }

    pub fn read_counter(&self, path: &Path) -> Result<u64> {
        let text = fs::read_to_string(path)?;
        parse_serial(&text).map_err(|reason| Error::Counter {
            path: path.display().to_string(),
            reason,
        })
    }

    pub fn write_counter(&self, path: &Path, value: u64) -> Result<()> {
        write_atomic(path, format!("{}\n", format_serial(value)))
    }

    /// Removes the archived certificates of a previous ledger.
    pub fn clear_newcerts(&self) -> Result<()> {
        let dir = self.newcerts_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(())
    }
}

/// Shared directory with convenience copies of every key, by name.
#[derive(Debug, Clone)]
pub struct KeyRegistry {
    dir: PathBuf,
}

impl KeyRegistry {
    pub fn key_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.key.pem", name))
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    /// Copies a key file into the registry under `name`.
    pub fn publish(&self, name: &str, source: &Path) -> Result<PathBuf> {
        self.ensure_layout()?;
        let target = self.key_path(name);
        let contents = fs::read(source)?;
        write_atomic(&target, contents)?;
        Ok(target)
    }
}

/// Writes through a sibling temp file and renames it into place, so a reader
/// never sees a partially written artifact.
pub fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
