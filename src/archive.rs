//! Append-only patch container.
//!
//! Layout: `MAGIC`, then entries back to back. Each entry is a bincode
//! [`EntryHeader`] followed by `stored_len` bytes of zstd-compressed payload.
//! Nothing is ever rewritten, so the manifest is written as the final entry
//! once every payload it refers to is already in place.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{PatchError, Result};
use crate::patch_format::{PatchManifest, MAGIC, MANIFEST_ENTRY};

const COMPRESSION_LEVEL: i32 = 3;
/// Upper bound on a serialized header; guards the reader against garbage lengths.
const MAX_HEADER_LEN: u64 = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    name: String,
    raw_len: u64,
    stored_len: u64,
}

fn header_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_HEADER_LEN)
}

/// Counts bytes pulled through so the uncompressed size can go in the header.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

pub struct ArchiveWriter<W: Write> {
    inner: W,
    names: HashSet<String>,
    payload_bytes: u64,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(mut inner: W) -> Result<Self> {
        inner.write_all(MAGIC)?;
        Ok(Self {
            inner,
            names: HashSet::new(),
            payload_bytes: 0,
        })
    }

    /// Append a payload entry. Returns its uncompressed size.
    pub fn add_entry<R: Read>(&mut self, name: &str, payload: R) -> Result<u64> {
        if name == MANIFEST_ENTRY {
            return Err(PatchError::ReservedPath(name.to_string()));
        }
        let raw_len = self.write_entry(name, payload)?;
        self.payload_bytes += raw_len;
        Ok(raw_len)
    }

    pub fn add_bytes(&mut self, name: &str, data: &[u8]) -> Result<u64> {
        self.add_entry(name, data)
    }

    /// Sum of uncompressed payload sizes written so far (manifest excluded).
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    /// Write the manifest as the last entry and hand back the underlying writer.
    pub fn finish(mut self, manifest: &PatchManifest) -> Result<W> {
        let text = manifest.to_json()?;
        self.write_entry(MANIFEST_ENTRY, text.as_bytes())?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_entry<R: Read>(&mut self, name: &str, payload: R) -> Result<u64> {
        if !self.names.insert(name.to_string()) {
            return Err(PatchError::DuplicateEntry(name.to_string()));
        }

        let mut counting = CountingReader {
            inner: payload,
            count: 0,
        };
        let compressed = zstd::stream::encode_all(&mut counting, COMPRESSION_LEVEL)?;

        let header = EntryHeader {
            name: name.to_string(),
            raw_len: counting.count,
            stored_len: compressed.len() as u64,
        };
        header_codec()
            .serialize_into(&mut self.inner, &header)
            .map_err(io::Error::other)?;
        self.inner.write_all(&compressed)?;

        Ok(header.raw_len)
    }
}

#[derive(Debug, Clone, Copy)]
struct EntryLocation {
    offset: u64,
    raw_len: u64,
    stored_len: u64,
}

pub struct ArchiveReader<R> {
    inner: R,
    entries: HashMap<String, EntryLocation>,
}

impl<R: Read + Seek> ArchiveReader<R> {
    /// Scan entry headers and remember where each payload lives.
    pub fn open(mut inner: R) -> Result<Self> {
        let end = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 8];
        if end < MAGIC.len() as u64 {
            return Err(PatchError::ArchiveCorrupt("missing magic header".into()));
        }
        inner.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(PatchError::ArchiveCorrupt("missing magic header".into()));
        }

        let mut entries = HashMap::new();
        loop {
            let pos = inner.stream_position()?;
            if pos == end {
                break;
            }
            let header: EntryHeader = header_codec()
                .deserialize_from(&mut inner)
                .map_err(|e| PatchError::ArchiveCorrupt(format!("bad entry header at offset {pos}: {e}")))?;
            let offset = inner.stream_position()?;
            let next = offset
                .checked_add(header.stored_len)
                .filter(|&next| next <= end)
                .ok_or_else(|| PatchError::ArchiveCorrupt(format!("entry {} is truncated", header.name)))?;

            let location = EntryLocation {
                offset,
                raw_len: header.raw_len,
                stored_len: header.stored_len,
            };
            if entries.insert(header.name.clone(), location).is_some() {
                return Err(PatchError::ArchiveCorrupt(format!(
                    "entry {} appears more than once",
                    header.name
                )));
            }
            inner.seek(SeekFrom::Start(next))?;
        }

        Ok(Self { inner, entries })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decompress entry `name` into `out`. Returns the number of bytes written.
    pub fn extract_to<W: Write + ?Sized>(&mut self, name: &str, out: &mut W) -> Result<u64> {
        let location = *self
            .entries
            .get(name)
            .ok_or_else(|| PatchError::MissingArchiveEntry(name.to_string()))?;

        self.inner.seek(SeekFrom::Start(location.offset))?;
        let limited = (&mut self.inner).take(location.stored_len);
        let mut decoder = zstd::stream::read::Decoder::new(limited)?;
        let written = io::copy(&mut decoder, out)?;
        if written != location.raw_len {
            return Err(PatchError::ArchiveCorrupt(format!(
                "entry {name} decoded to {written} bytes, expected {}",
                location.raw_len
            )));
        }
        Ok(written)
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        self.extract_to(name, &mut data)?;
        Ok(data)
    }

    /// Raw manifest text, as stored.
    pub fn manifest_text(&mut self) -> Result<String> {
        if !self.contains(MANIFEST_ENTRY) {
            return Err(PatchError::ManifestMissing);
        }
        let bytes = self.read_entry(MANIFEST_ENTRY)?;
        String::from_utf8(bytes).map_err(|e| PatchError::ManifestMalformed(e.to_string()))
    }

    pub fn manifest(&mut self) -> Result<PatchManifest> {
        PatchManifest::from_json(&self.manifest_text()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::digest_bytes;
    use crate::patch_format::PatchOperation;
    use std::io::Cursor;

    fn build(entries: &[(&str, &[u8])], manifest: Option<&PatchManifest>) -> Vec<u8> {
        let mut writer = ArchiveWriter::new(Vec::new()).unwrap();
        for (name, data) in entries {
            writer.add_bytes(name, data).unwrap();
        }
        match manifest {
            Some(manifest) => writer.finish(manifest).unwrap(),
            None => writer.inner,
        }
    }

    #[test]
    fn test_entries_and_manifest_read_back() {
        let mut manifest = PatchManifest::default();
        manifest.push(PatchOperation::Add {
            file_name: "extra.txt".into(),
            final_hash: digest_bytes(b"hi"),
        });
        let bytes = build(&[("extra.txt", b"hi"), ("big.bin", &[0u8; 100_000])], Some(&manifest));

        let mut reader = ArchiveReader::open(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.read_entry("extra.txt").unwrap(), b"hi");
        assert_eq!(reader.read_entry("big.bin").unwrap(), vec![0u8; 100_000]);
        assert_eq!(reader.manifest().unwrap(), manifest);
    }

    #[test]
    fn test_payload_bytes_counts_uncompressed_sizes() {
        let mut writer = ArchiveWriter::new(Vec::new()).unwrap();
        writer.add_bytes("a", &[1u8; 1000]).unwrap();
        writer.add_bytes("b", b"xyz").unwrap();
        assert_eq!(writer.payload_bytes(), 1003);
    }

    #[test]
    fn test_write_once() {
        let mut writer = ArchiveWriter::new(Vec::new()).unwrap();
        writer.add_bytes("a", b"1").unwrap();
        assert!(matches!(
            writer.add_bytes("a", b"2"),
            Err(PatchError::DuplicateEntry(_))
        ));
        assert!(matches!(
            writer.add_bytes(MANIFEST_ENTRY, b"{}"),
            Err(PatchError::ReservedPath(_))
        ));
    }

    #[test]
    fn test_manifest_missing() {
        let bytes = build(&[("a", b"1")], None);
        let mut reader = ArchiveReader::open(Cursor::new(bytes)).unwrap();
        assert!(matches!(reader.manifest(), Err(PatchError::ManifestMissing)));
    }

    #[test]
    fn test_missing_entry() {
        let bytes = build(&[], Some(&PatchManifest::default()));
        let mut reader = ArchiveReader::open(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.read_entry("nope"),
            Err(PatchError::MissingArchiveEntry(_))
        ));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        assert!(matches!(
            ArchiveReader::open(Cursor::new(b"NOTANARCHIVE".to_vec())),
            Err(PatchError::ArchiveCorrupt(_))
        ));

        let mut bytes = build(&[("a", &[7u8; 4096])], Some(&PatchManifest::default()));
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            ArchiveReader::open(Cursor::new(bytes)),
            Err(PatchError::ArchiveCorrupt(_))
        ));
    }
}
