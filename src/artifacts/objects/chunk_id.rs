//! Chunk identifier (SHA-1 content address)
//!
//! Chunk IDs are 40-character hexadecimal strings. A chunk stored on disk
//! lives under `<first-2-chars>/<remaining-38-chars>` inside the chunk
//! store root.

use crate::artifacts::objects::CHUNK_ID_LENGTH;
use sha1::{Digest, Sha1};
use std::io;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ChunkId(String);

impl ChunkId {
    /// Parse and validate a chunk ID from a 40-char hex string.
    pub fn try_parse(id: String) -> anyhow::Result<Self> {
        if id.len() != CHUNK_ID_LENGTH {
            anyhow::bail!("Invalid chunk ID length: {}", id.len());
        }
        if !id.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Invalid chunk ID characters: {}", id);
        }
        Ok(Self(id.to_ascii_lowercase()))
    }

    /// Address of the given content.
    pub fn for_content(content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(content);

        Self(format!("{:x}", hasher.finalize()))
    }

    /// Write the ID in its 20-byte binary form.
    pub fn write_h40_to<W: io::Write>(&self, writer: &mut W) -> anyhow::Result<()> {
        let hex40 = self.as_ref();

        for i in (0..CHUNK_ID_LENGTH).step_by(2) {
            let byte = u8::from_str_radix(&hex40[i..i + 2], 16)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid hex digit"))?;
            writer.write_all(&[byte])?;
        }

        Ok(())
    }

    /// Read an ID from its 20-byte binary form.
    pub fn read_h40_from<R: io::Read + ?Sized>(reader: &mut R) -> anyhow::Result<Self> {
        let mut raw = [0u8; CHUNK_ID_LENGTH / 2];
        reader.read_exact(&mut raw)?;

        let hex40 = raw.iter().map(|byte| format!("{byte:02x}")).collect();
        Self::try_parse(hex40)
    }

    /// Split the hash as `XX/YYYY...` for on-disk storage.
    pub fn to_path(&self) -> PathBuf {
        let (dir, file) = self.0.split_at(2);
        PathBuf::from(dir).join(file)
    }

    pub fn to_short_id(&self) -> &str {
        &self.0[..7]
    }
}

impl AsRef<str> for ChunkId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
