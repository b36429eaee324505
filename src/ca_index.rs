//! Issued-certificate index of the local CA
//!
//! Kept in the same on-disk shape `openssl ca` uses, so a CA directory can be
//! moved between the local and the CLI backend:
//!
//! - `serial`: next serial number, hex, one line
//! - `index.txt`: one tab-separated line per issued certificate
//!   (`V`, expiry `YYMMDDHHMMSSZ`, revocation date, serial, file, subject)
//!
//! The serial file is advanced before the index line is appended, so a
//! failed append can skip a serial but never hand the same one out twice.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use openssl::bn::BigNum;
use openssl::x509::X509NameRef;

pub struct CaIndex {
    serial_path: PathBuf,
    index_path: PathBuf,
    next_serial: BigNum,
    valid_subjects: HashSet<String>,
}

/// One parsed line of `index.txt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexRecord {
    pub status: char,
    pub expires: String,
    pub serial: String,
    pub subject: String,
}

impl CaIndex {
    pub fn open(serial_path: &Path, index_path: &Path) -> Result<Self> {
        let serial_hex = fs::read_to_string(serial_path)
            .context(format!("Failed to read serial file {}", serial_path.display()))?;
        let next_serial = BigNum::from_hex_str(serial_hex.trim())
            .map_err(|e| anyhow!("Malformed serial file {}: {}", serial_path.display(), e))?;

        let records = read_records(index_path)?;
        let valid_subjects = records
            .into_iter()
            .filter(|r| r.status == 'V')
            .map(|r| r.subject)
            .collect();

        Ok(Self {
            serial_path: serial_path.to_path_buf(),
            index_path: index_path.to_path_buf(),
            next_serial,
            valid_subjects,
        })
    }

    pub fn next_serial(&self) -> &BigNum {
        &self.next_serial
    }

    pub fn has_valid_subject(&self, subject: &str) -> bool {
        self.valid_subjects.contains(subject)
    }

    /// Commit the current serial as issued for `subject` and advance the counter
    pub fn record_issued(&mut self, subject: &str, expires: DateTime<Utc>) -> Result<BigNum> {
        let issued = self.next_serial.to_owned()?;
        let mut following = BigNum::new()?;
        let one: BigNum = BigNum::from_u32(1)?;
        following.checked_add(&issued, &one)?;

        write_atomically(
            &self.serial_path,
            format!("{}\n", following.to_hex_str()?).as_bytes(),
        )
        .context("Failed to advance serial file")?;
        self.next_serial = following;

        let line = format!(
            "V\t{}\t\t{}\tunknown\t{}\n",
            expires.format("%y%m%d%H%M%SZ"),
            issued.to_hex_str()?,
            subject
        );
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.index_path)
            .context(format!("Failed to open index {}", self.index_path.display()))?;
        index
            .write_all(line.as_bytes())
            .context("Failed to append index entry")?;
        index.sync_all()?;

        self.valid_subjects.insert(subject.to_string());
        Ok(issued)
    }

    pub fn records(&self) -> Result<Vec<IndexRecord>> {
        read_records(&self.index_path)
    }
}

fn read_records(index_path: &Path) -> Result<Vec<IndexRecord>> {
    let contents = match fs::read_to_string(index_path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            return Err(e).context(format!("Failed to read index {}", index_path.display()))
        }
    };

    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            if fields.len() != 6 {
                return Err(anyhow!("Malformed index line: {:?}", line));
            }
            let status = fields[0]
                .chars()
                .next()
                .ok_or_else(|| anyhow!("Missing status in index line: {:?}", line))?;
            Ok(IndexRecord {
                status,
                expires: fields[1].to_string(),
                serial: fields[3].to_string(),
                subject: fields[5].to_string(),
            })
        })
        .collect()
}

fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("new");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

/// Render a name the way `openssl ca` writes it into `index.txt`
pub fn oneline_subject(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("UNDEF");
            let value = String::from_utf8_lossy(entry.data().as_slice());
            format!("/{}={}", key, value)
        })
        .collect()
}
