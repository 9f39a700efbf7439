//! Issuance ledger in the OpenSSL `index.txt` format.
//!
//! One tab separated row per issued certificate:
//!
//! ```text
//! V	300101000000Z		1001	unknown	/C=BE/O=Example Inc/CN=Intermediate CA
//! R	220101000000Z	201201000000Z,keyCompromise	1002	unknown	/CN=Bob
//! ```

use crate::error::{Error, Result};
use crate::types::RevocationReason;
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Valid,
    Revoked,
    Expired,
}

impl EntryStatus {
    fn flag(&self) -> char {
        match self {
            EntryStatus::Valid => 'V',
            EntryStatus::Revoked => 'R',
            EntryStatus::Expired => 'E',
        }
    }

    fn from_flag(flag: &str) -> Result<Self> {
        match flag {
            "V" => Ok(EntryStatus::Valid),
            "R" => Ok(EntryStatus::Revoked),
            "E" => Ok(EntryStatus::Expired),
            other => Err(Error::Ledger(format!("unknown status flag {:?}", other))),
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryStatus::Valid => "valid",
            EntryStatus::Revoked => "revoked",
            EntryStatus::Expired => "expired",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    pub at: DateTime<Utc>,
    pub reason: Option<RevocationReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub status: EntryStatus,
    pub expires_at: DateTime<Utc>,
    pub revocation: Option<Revocation>,
    pub serial: u64,
    pub file_name: String,
    pub subject: String,
}

impl LedgerEntry {
    pub fn new(serial: u64, expires_at: DateTime<Utc>, subject: impl Into<String>) -> Self {
        Self {
            status: EntryStatus::Valid,
            expires_at,
            revocation: None,
            serial,
            file_name: "unknown".to_string(),
            subject: subject.into(),
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.status == EntryStatus::Revoked
    }

    pub fn serial_hex(&self) -> String {
        format_serial(self.serial)
    }

    fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 6 {
            return Err(Error::Ledger(format!(
                "expected 6 tab separated fields, found {}: {:?}",
                fields.len(),
                line
            )));
        }

        let status = EntryStatus::from_flag(fields[0])?;
        let expires_at = parse_time(fields[1])?;
        let revocation = if fields[2].is_empty() {
            None
        } else {
            let (at, reason) = match fields[2].split_once(',') {
                Some((at, reason)) => (at, Some(reason.parse::<RevocationReason>()?)),
                None => (fields[2], None),
            };
            Some(Revocation {
                at: parse_time(at)?,
                reason,
            })
        };
        if (status == EntryStatus::Revoked) != revocation.is_some() {
            return Err(Error::Ledger(format!(
                "status and revocation column disagree: {:?}",
                line
            )));
        }
        let serial = parse_serial(fields[3])
            .map_err(|reason| Error::Ledger(format!("serial {:?}: {}", fields[3], reason)))?;

        Ok(Self {
            status,
            expires_at,
            revocation,
            serial,
            file_name: fields[4].to_string(),
            subject: fields[5].to_string(),
        })
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let revocation = match &self.revocation {
            Some(Revocation {
                at,
                reason: Some(reason),
            }) => format!("{},{}", format_time(at), reason.openssl_name()),
            Some(Revocation { at, reason: None }) => format_time(at),
            None => String::new(),
        };
        write!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}",
            self.status.flag(),
            format_time(&self.expires_at),
            revocation,
            self.serial_hex(),
            self.file_name,
            self.subject
        )
    }
}

/// Ordered record of every certificate a CA instance has issued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut ledger = Ledger::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            ledger.push(LedgerEntry::parse(line)?)?;
        }
        Ok(ledger)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&entry.to_string());
            out.push('\n');
        }
        out
    }

    /// Appends an entry; serials must strictly increase.
    pub fn push(&mut self, entry: LedgerEntry) -> Result<()> {
        if let Some(last) = self.last_serial() {
            if entry.serial <= last {
                return Err(Error::Ledger(format!(
                    "serial {} does not follow last issued serial {}",
                    format_serial(entry.serial),
                    format_serial(last)
                )));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_serial(&self) -> Option<u64> {
        self.entries.last().map(|e| e.serial)
    }

    pub fn find(&self, serial: u64) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.serial == serial)
    }

    pub fn revoked(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().filter(|e| e.is_revoked())
    }

    /// Marks `serial` revoked as of `at`. Only the status and revocation
    /// columns change.
    pub fn revoke(
        &mut self,
        serial: u64,
        at: DateTime<Utc>,
        reason: Option<RevocationReason>,
    ) -> Result<&LedgerEntry> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.serial == serial)
            .ok_or_else(|| Error::NotFound(format!("serial {} in ledger", format_serial(serial))))?;

        if entry.is_revoked() {
            return Err(Error::AlreadyRevoked(format_serial(serial)));
        }

        entry.status = EntryStatus::Revoked;
        entry.revocation = Some(Revocation { at, reason });
        Ok(entry)
    }
}

/// Uppercase, even length hex as written by `openssl ca`.
pub fn format_serial(serial: u64) -> String {
    let hex = format!("{:X}", serial);
    if hex.len() % 2 == 1 {
        format!("0{}", hex)
    } else {
        hex
    }
}

pub fn parse_serial(text: &str) -> std::result::Result<u64, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty serial".to_string());
    }
    u64::from_str_radix(text, 16).map_err(|e| e.to_string())
}

/// UTCTime for 1950..=2049, GeneralizedTime otherwise (RFC 5280 4.1.2.5).
pub fn format_time(at: &DateTime<Utc>) -> String {
    if (1950..2050).contains(&at.year()) {
        at.format("%y%m%d%H%M%SZ").to_string()
    } else {
        at.format("%Y%m%d%H%M%SZ").to_string()
    }
}

pub fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    let full = match text.len() {
        13 => {
            let yy: u32 = text[..2]
                .parse()
                .map_err(|_| Error::Ledger(format!("bad time {:?}", text)))?;
            let century = if yy >= 50 { "19" } else { "20" };
            format!("{}{}", century, text)
        }
        15 => text.to_string(),
        _ => return Err(Error::Ledger(format!("bad time {:?}", text))),
    };
    let naive = NaiveDateTime::parse_from_str(&full, "%Y%m%d%H%M%SZ")
        .map_err(|e| Error::Ledger(format!("bad time {:?}: {}", text, e)))?;
    Ok(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_time_formats() {
        assert_eq!(format_time(&at(2020, 12, 1)), "201201000000Z");
        assert_eq!(format_time(&at(2100, 1, 1)), "21000101000000Z");
        assert_eq!(parse_time("201201000000Z").unwrap(), at(2020, 12, 1));
        assert_eq!(parse_time("991231000000Z").unwrap(), at(1999, 12, 31));
        assert_eq!(parse_time("25000101000000Z").unwrap(), at(2500, 1, 1));
        assert!(parse_time("2020").is_err());
    }

    #[test]
    fn test_serial_format() {
        assert_eq!(format_serial(0x1000), "1000");
        assert_eq!(format_serial(0xABC), "0ABC");
        assert_eq!(parse_serial("0abc"), Ok(0xABC));
        assert!(parse_serial("").is_err());
    }

    #[test]
    fn test_parse_openssl_index() {
        let text = "V\t300101000000Z\t\t1000\tunknown\t/C=BE/O=Example Inc/CN=Root CA\n\
                    R\t220101000000Z\t201201000000Z,keyCompromise\t1001\tunknown\t/CN=Bob\n";
        let ledger = Ledger::parse(text).unwrap();

        assert_eq!(ledger.len(), 2);
        let bob = ledger.find(0x1001).unwrap();
        assert!(bob.is_revoked());
        assert_eq!(
            bob.revocation,
            Some(Revocation {
                at: at(2020, 12, 1),
                reason: Some(RevocationReason::KeyCompromise)
            })
        );
        assert_eq!(ledger.render(), text);
    }

    #[test]
    fn test_rejects_non_increasing_serials() {
        let mut ledger = Ledger::new();
        ledger.push(LedgerEntry::new(5, at(2030, 1, 1), "/CN=a")).unwrap();
        assert!(ledger.push(LedgerEntry::new(5, at(2030, 1, 1), "/CN=b")).is_err());
        assert!(ledger.push(LedgerEntry::new(4, at(2030, 1, 1), "/CN=b")).is_err());
    }

    #[test]
    fn test_rejects_inconsistent_status() {
        assert!(Ledger::parse("R\t300101000000Z\t\t10\tunknown\t/CN=x\n").is_err());
        assert!(Ledger::parse("V\t300101000000Z\t201201000000Z\t10\tunknown\t/CN=x\n").is_err());
        assert!(Ledger::parse("V\t300101000000Z\t10\tunknown\n").is_err());
    }

    #[test]
    fn test_revoke_preserves_other_columns() {
        let mut ledger = Ledger::new();
        ledger.push(LedgerEntry::new(0x1000, at(2022, 1, 1), "/CN=Alice")).unwrap();
        ledger.push(LedgerEntry::new(0x1001, at(2022, 1, 1), "/CN=Bob")).unwrap();
        let before = ledger.render();

        ledger
            .revoke(0x1001, at(2020, 12, 1), Some(RevocationReason::KeyCompromise))
            .unwrap();
        let after = ledger.render();

        let before_bob: Vec<&str> = before.lines().nth(1).unwrap().split('\t').collect();
        let after_bob: Vec<&str> = after.lines().nth(1).unwrap().split('\t').collect();
        assert_eq!(after_bob[0], "R");
        assert_eq!(after_bob[2], "201201000000Z,keyCompromise");
        assert_eq!(before_bob[1], after_bob[1]);
        assert_eq!(before_bob[3..], after_bob[3..]);
        assert_eq!(before.lines().next(), after.lines().next());
    }

    #[test]
    fn test_revoke_errors() {
        let mut ledger = Ledger::new();
        ledger.push(LedgerEntry::new(7, at(2022, 1, 1), "/CN=Bob")).unwrap();

        assert!(matches!(
            ledger.revoke(8, at(2020, 1, 1), None),
            Err(Error::NotFound(_))
        ));
        ledger.revoke(7, at(2020, 1, 1), None).unwrap();
        assert!(matches!(
            ledger.revoke(7, at(2020, 1, 1), None),
            Err(Error::AlreadyRevoked(_))
        ));
        assert_eq!(ledger.revoked().count(), 1);
    }
}
