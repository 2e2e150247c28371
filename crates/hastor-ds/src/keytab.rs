//! MIT keytab file codec (format version `0x0502`).
//!
//! ```text
//! keytab   := u16 version, entry*
//! entry    := i32 size (negative: hole of |size| bytes), record
//! record   := u16 ncomp, data realm, data[ncomp] components,
//!             u32 name_type, u32 timestamp, u8 kvno8,
//!             u16 enctype, data key, [u32 kvno]
//! data     := u16 length, bytes
//! ```
//!
//! All integers are big-endian.

use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

/// Keytab version written and accepted.
pub const KEYTAB_VERSION: u16 = 0x0502;

/// Kerberos principal name type for service and host principals.
pub const KRB5_NT_PRINCIPAL: u32 = 1;

/// Keytab decoding errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeytabError {
    /// Unsupported file format version.
    #[error("unsupported keytab version {0:#06x}")]
    BadVersion(u16),

    /// The data ended inside a record.
    #[error("keytab truncated at offset {0}")]
    Truncated(usize),

    /// A principal component was not UTF-8.
    #[error("keytab entry at offset {0} has a non UTF-8 principal")]
    InvalidUtf8(usize),

    /// A field is too long to encode.
    #[error("keytab field too long: {0} bytes")]
    TooLong(usize),
}

/// One key for one principal.
#[derive(Clone, PartialEq, Eq)]
pub struct KeytabEntry {
    /// Realm.
    pub realm: String,
    /// Principal components, e.g. `["host", "nas.example.com"]`.
    pub components: Vec<String>,
    /// Principal name type.
    pub name_type: u32,
    /// Seconds since the epoch when the key was written.
    pub timestamp: u32,
    /// Key version number.
    pub kvno: u32,
    /// Encryption type.
    pub enctype: u16,
    /// Key material.
    pub key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for KeytabEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeytabEntry")
            .field("principal", &self.principal())
            .field("kvno", &self.kvno)
            .field("enctype", &self.enctype)
            .finish_non_exhaustive()
    }
}

impl KeytabEntry {
    /// `comp1/comp2@REALM`.
    pub fn principal(&self) -> String {
        format!("{}@{}", self.components.join("/"), self.realm)
    }
}

/// A decoded keytab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keytab {
    /// Entries in file order.
    pub entries: Vec<KeytabEntry>,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], KeytabError> {
        let end = self.pos.checked_add(n).ok_or(KeytabError::Truncated(self.pos))?;
        let out = self.buf.get(self.pos..end).ok_or(KeytabError::Truncated(self.pos))?;
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, KeytabError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, KeytabError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, KeytabError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn data(&mut self) -> Result<&'a [u8], KeytabError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, KeytabError> {
        let at = self.pos;
        let bytes = self.data()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| KeytabError::InvalidUtf8(at))
    }
}

fn put_data(out: &mut Vec<u8>, data: &[u8]) -> Result<(), KeytabError> {
    let len = u16::try_from(data.len()).map_err(|_| KeytabError::TooLong(data.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

impl Keytab {
    /// Decode a keytab.
    pub fn parse(buf: &[u8]) -> Result<Self, KeytabError> {
        let mut r = Reader { buf, pos: 0 };
        let version = r.u16()?;
        if version != KEYTAB_VERSION {
            return Err(KeytabError::BadVersion(version));
        }
        let mut entries = Vec::new();
        while r.pos < buf.len() {
            let size = r.u32()? as i32;
            if size < 0 {
                r.take(size.unsigned_abs() as usize)?;
                continue;
            }
            if size == 0 {
                // Zero-length slot terminates the file.
                break;
            }
            let record = r.take(size as usize)?;
            let base = r.pos - record.len();
            entries.push(parse_record(record, base)?);
        }
        Ok(Self { entries })
    }

    /// Read and decode `path`.
    pub fn read(path: &Path) -> std::io::Result<Result<Self, KeytabError>> {
        Ok(Self::parse(&std::fs::read(path)?))
    }

    /// Encode the keytab.
    pub fn to_bytes(&self) -> Result<Vec<u8>, KeytabError> {
        let mut out = KEYTAB_VERSION.to_be_bytes().to_vec();
        for e in &self.entries {
            let mut rec = Vec::new();
            let ncomp = u16::try_from(e.components.len()).map_err(|_| KeytabError::TooLong(e.components.len()))?;
            rec.extend_from_slice(&ncomp.to_be_bytes());
            put_data(&mut rec, e.realm.as_bytes())?;
            for c in &e.components {
                put_data(&mut rec, c.as_bytes())?;
            }
            rec.extend_from_slice(&e.name_type.to_be_bytes());
            rec.extend_from_slice(&e.timestamp.to_be_bytes());
            rec.push(e.kvno.min(255) as u8);
            rec.extend_from_slice(&e.enctype.to_be_bytes());
            put_data(&mut rec, &e.key)?;
            rec.extend_from_slice(&e.kvno.to_be_bytes());
            let size = i32::try_from(rec.len()).map_err(|_| KeytabError::TooLong(rec.len()))?;
            out.extend_from_slice(&size.to_be_bytes());
            out.extend_from_slice(&rec);
        }
        Ok(out)
    }

    /// Entries for `principal`, compared case-insensitively.
    pub fn entries_for<'a>(&'a self, principal: &'a str) -> impl Iterator<Item = &'a KeytabEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.principal().eq_ignore_ascii_case(principal))
    }

    /// Whether any key for `principal` is present.
    pub fn has_principal(&self, principal: &str) -> bool {
        self.entries_for(principal).next().is_some()
    }

    /// Replace every entry of the principals present in `other` with the
    /// entries from `other`; keep the rest.
    pub fn merge(&mut self, other: &Keytab) {
        let replaced: Vec<String> = other.entries.iter().map(|e| e.principal().to_ascii_lowercase()).collect();
        self.entries
            .retain(|e| !replaced.contains(&e.principal().to_ascii_lowercase()));
        self.entries.extend(other.entries.iter().cloned());
    }
}

fn parse_record(record: &[u8], base: usize) -> Result<KeytabEntry, KeytabError> {
    let mut r = Reader { buf: record, pos: 0 };
    let offset = |e: KeytabError| match e {
        KeytabError::Truncated(p) => KeytabError::Truncated(base + p),
        KeytabError::InvalidUtf8(p) => KeytabError::InvalidUtf8(base + p),
        other => other,
    };
    let ncomp = r.u16().map_err(offset)?;
    let realm = r.string().map_err(offset)?;
    let components = (0..ncomp)
        .map(|_| r.string())
        .collect::<Result<Vec<_>, _>>()
        .map_err(offset)?;
    let name_type = r.u32().map_err(offset)?;
    let timestamp = r.u32().map_err(offset)?;
    let kvno8 = r.u8().map_err(offset)?;
    let enctype = r.u16().map_err(offset)?;
    let key = Zeroizing::new(r.data().map_err(offset)?.to_vec());
    // The trailing 32-bit kvno is optional and wins when non-zero.
    let kvno = match record.len() - r.pos {
        n if n >= 4 => match r.u32().map_err(offset)? {
            0 => u32::from(kvno8),
            v => v,
        },
        _ => u32::from(kvno8),
    };
    Ok(KeytabEntry {
        realm,
        components,
        name_type,
        timestamp,
        kvno,
        enctype,
        key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(principal: &[&str], realm: &str, kvno: u32) -> KeytabEntry {
        KeytabEntry {
            realm: realm.into(),
            components: principal.iter().map(|s| s.to_string()).collect(),
            name_type: KRB5_NT_PRINCIPAL,
            timestamp: 1_700_000_000,
            kvno,
            enctype: 18,
            key: Zeroizing::new(vec![0xAA; 32]),
        }
    }

    #[test]
    fn test_encode_decode() {
        let kt = Keytab {
            entries: vec![
                entry(&["TRUENAS$"], "AD.EXAMPLE.COM", 3),
                entry(&["host", "truenas.ad.example.com"], "AD.EXAMPLE.COM", 300),
            ],
        };
        let bytes = kt.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &[0x05, 0x02]);
        let back = Keytab::parse(&bytes).unwrap();
        assert_eq!(back, kt);
        assert_eq!(back.entries[1].principal(), "host/truenas.ad.example.com@AD.EXAMPLE.COM");
        assert_eq!(back.entries[1].kvno, 300);
    }

    #[test]
    fn test_principal_lookup_case_insensitive() {
        let kt = Keytab {
            entries: vec![entry(&["TRUENAS$"], "AD.EXAMPLE.COM", 1)],
        };
        assert!(kt.has_principal("truenas$@ad.example.com"));
        assert!(!kt.has_principal("OTHER$@AD.EXAMPLE.COM"));
    }

    #[test]
    fn test_bad_version() {
        assert_eq!(Keytab::parse(&[0x05, 0x01]), Err(KeytabError::BadVersion(0x0501)));
    }

    #[test]
    fn test_truncated_record() {
        let mut bytes = Keytab {
            entries: vec![entry(&["a"], "R", 1)],
        }
        .to_bytes()
        .unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(Keytab::parse(&bytes), Err(KeytabError::Truncated(_))));
    }

    #[test]
    fn test_hole_skipped() {
        let mut bytes = KEYTAB_VERSION.to_be_bytes().to_vec();
        bytes.extend_from_slice(&(-4i32).to_be_bytes());
        bytes.extend_from_slice(&[0; 4]);
        let tail = Keytab {
            entries: vec![entry(&["a"], "R", 2)],
        }
        .to_bytes()
        .unwrap();
        bytes.extend_from_slice(&tail[2..]);
        let kt = Keytab::parse(&bytes).unwrap();
        assert_eq!(kt.entries.len(), 1);
    }

    #[test]
    fn test_kvno8_used_when_trailer_absent() {
        let full = Keytab {
            entries: vec![entry(&["a"], "R", 7)],
        }
        .to_bytes()
        .unwrap();
        // Drop the trailing kvno and fix up the record size.
        let mut bytes = full[..full.len() - 4].to_vec();
        let size = (full.len() - 4 - 6) as i32;
        bytes[2..6].copy_from_slice(&size.to_be_bytes());
        assert_eq!(Keytab::parse(&bytes).unwrap().entries[0].kvno, 7);
    }

    #[test]
    fn test_merge_replaces_principal() {
        let mut kt = Keytab {
            entries: vec![entry(&["TRUENAS$"], "AD", 1), entry(&["nfs", "x"], "AD", 1)],
        };
        let fresh = Keytab {
            entries: vec![entry(&["TRUENAS$"], "AD", 2)],
        };
        kt.merge(&fresh);
        assert_eq!(kt.entries.len(), 2);
        assert_eq!(kt.entries_for("TRUENAS$@AD").next().unwrap().kvno, 2);
    }

    #[test]
    fn test_debug_hides_key() {
        let e = entry(&["a"], "R", 1);
        assert!(!format!("{e:?}").contains("170"));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Keytab::parse(&bytes);
        }
    }
}
