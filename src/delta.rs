use std::io::{self, Write};

/// Binary delta transform between two versions of a file.
///
/// The engine treats the delta as opaque: whatever `create` produced for
/// `(old, new)`, `apply` must turn back into `new` given `old`.
pub trait DeltaCodec: Send + Sync {
    fn create(&self, old: &[u8], new: &[u8]) -> io::Result<Vec<u8>>;

    /// Reconstruct the new content into `out`, returning the number of bytes written.
    fn apply(&self, old: &[u8], delta: &[u8], out: &mut dyn Write) -> io::Result<u64>;
}

/// bsdiff 4.x compatible deltas.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bsdiff;

impl DeltaCodec for Bsdiff {
    fn create(&self, old: &[u8], new: &[u8]) -> io::Result<Vec<u8>> {
        let mut patch = Vec::new();
        qbsdiff::Bsdiff::new(old, new).compare(io::Cursor::new(&mut patch))?;
        Ok(patch)
    }

    fn apply(&self, old: &[u8], delta: &[u8], out: &mut dyn Write) -> io::Result<u64> {
        let patcher = qbsdiff::Bspatch::new(delta)?;
        patcher.apply(old, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(old: &[u8], new: &[u8]) -> Vec<u8> {
        let codec = Bsdiff;
        let delta = codec.create(old, new).unwrap();
        let mut out = Vec::new();
        let written = codec.apply(old, &delta, &mut out).unwrap();
        assert_eq!(written as usize, out.len());
        out
    }

    #[test]
    fn test_small_edit() {
        assert_eq!(round_trip(b"AAAA", b"AABB"), b"AABB");
    }

    #[test]
    fn test_insertion_in_middle() {
        let old: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
        let mut new = old.clone();
        new.splice(8000..8000, vec![0xAA; 100]);
        assert_eq!(round_trip(&old, &new), new);
    }

    #[test]
    fn test_garbage_delta_is_rejected() {
        let mut out = Vec::new();
        assert!(Bsdiff.apply(b"old", b"not a delta", &mut out).is_err());
    }
}
