//! Content digests used for pre- and post-image verification.
//!
//! Both stream shapes hash the whole stream from offset zero and put the
//! caller's position back afterwards, so a handle can be hashed and then
//! reused by the next step of the pipeline.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::cancel::CancelToken;
use crate::error::{PatchError, Result};

/// Read buffer for hashing. 256 KB keeps syscall count low on large game assets.
const HASH_CHUNK: usize = 256 * 1024;

/// A 32-byte BLAKE3 content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Digest of an in-memory buffer.
pub fn digest_bytes(data: &[u8]) -> Digest {
    blake3::hash(data).into()
}

/// Digest of an entire seekable stream; the stream position is unchanged on return.
pub fn digest_of<S: Read + Seek>(stream: &mut S) -> io::Result<Digest> {
    let saved = stream.stream_position()?;
    stream.seek(SeekFrom::Start(0))?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let hashed = loop {
        match stream.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                hasher.update(&buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };

    stream.seek(SeekFrom::Start(saved))?;
    hashed?;
    Ok(hasher.finalize().into())
}

/// Async counterpart of [`digest_of`].
///
/// When `cancel` is given it is checked between chunks; a cancelled hash still
/// restores the stream position before returning [`PatchError::Cancelled`].
pub async fn digest_of_async<S>(stream: &mut S, cancel: Option<&CancelToken>) -> Result<Digest>
where
    S: AsyncRead + AsyncSeek + Unpin,
{
    let saved = stream.stream_position().await?;
    stream.seek(SeekFrom::Start(0)).await?;

    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_CHUNK];
    let hashed: Result<()> = loop {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            break Err(PatchError::Cancelled);
        }
        match stream.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => {
                hasher.update(&buf[..n]);
            }
            Err(e) => break Err(e.into()),
        }
    };

    stream.seek(SeekFrom::Start(saved)).await?;
    hashed?;
    Ok(hasher.finalize().into())
}
