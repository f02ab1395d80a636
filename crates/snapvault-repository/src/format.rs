//! Checksummed metadata blob format.
//!
//! Every metadata blob is framed as:
//!
//! ```text
//! magic (4) | name_len (1) | name | flags (1) | body | blake3(header + body) (32)
//! ```
//!
//! `name` identifies the document kind (`index-n`, `snapshot`, ...). Bit 0 of
//! `flags` marks an LZ4-compressed body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{RepositoryError, Result};

const MAGIC: &[u8; 4] = b"SNVB";
const DIGEST_LEN: usize = 32;
const FLAG_LZ4: u8 = 0b0000_0001;

/// Body compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    None,
    Lz4,
}

impl Codec {
    pub fn from_compress(compress: bool) -> Self {
        if compress { Self::Lz4 } else { Self::None }
    }

    fn flags(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => FLAG_LZ4,
        }
    }

    fn compress(self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::None => input.to_vec(),
            Self::Lz4 => lz4_flex::compress_prepend_size(input),
        }
    }

    fn decompress(self, input: &[u8]) -> std::result::Result<Vec<u8>, String> {
        match self {
            Self::None => Ok(input.to_vec()),
            Self::Lz4 => lz4_flex::decompress_size_prepended(input).map_err(|e| e.to_string()),
        }
    }
}

/// Encoder/decoder for one kind of metadata document.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumBlobFormat {
    name: &'static str,
}

/// Root `index-N` documents.
pub const INDEX_N_FORMAT: ChecksumBlobFormat = ChecksumBlobFormat::new("index-n");
/// Root `snap-<uuid>.dat` documents.
pub const SNAPSHOT_FORMAT: ChecksumBlobFormat = ChecksumBlobFormat::new("snapshot");
/// Root `meta-<uuid>.dat` documents.
pub const GLOBAL_METADATA_FORMAT: ChecksumBlobFormat = ChecksumBlobFormat::new("metadata");
/// Per-index `meta-<uuid>.dat` documents.
pub const INDEX_METADATA_FORMAT: ChecksumBlobFormat = ChecksumBlobFormat::new("index-metadata");
/// Per-shard `index-<gen>` documents.
pub const SHARD_INDEX_FORMAT: ChecksumBlobFormat = ChecksumBlobFormat::new("snapshots");
/// Per-shard `snap-<uuid>.dat` documents.
pub const SHARD_SNAPSHOT_FORMAT: ChecksumBlobFormat = ChecksumBlobFormat::new("shard-snapshot");

impl ChecksumBlobFormat {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Frames `body`.
    pub fn encode(&self, body: &[u8], codec: Codec) -> Bytes {
        let payload = codec.compress(body);
        let mut buf =
            BytesMut::with_capacity(MAGIC.len() + 2 + self.name.len() + payload.len() + DIGEST_LEN);
        buf.put_slice(MAGIC);
        buf.put_u8(self.name.len() as u8);
        buf.put_slice(self.name.as_bytes());
        buf.put_u8(codec.flags());
        buf.put_slice(&payload);
        let digest = blake3::hash(&buf);
        buf.put_slice(digest.as_bytes());
        buf.freeze()
    }

    /// Verifies and unframes a blob read from `blob`.
    ///
    /// `repository` and `blob` are only used for error context.
    pub fn decode(&self, repository: &str, blob: &str, data: &[u8]) -> Result<Vec<u8>> {
        let corrupt = |reason: String| RepositoryError::CorruptState {
            repository: repository.to_string(),
            blob: blob.to_string(),
            reason,
        };

        let header_len = MAGIC.len() + 1;
        if data.len() < header_len + DIGEST_LEN + 1 {
            return Err(corrupt(format!("truncated blob of {} bytes", data.len())));
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(corrupt("bad magic".to_string()));
        }

        let (framed, digest) = data.split_at(data.len() - DIGEST_LEN);
        if blake3::hash(framed).as_bytes() != digest {
            return Err(corrupt("checksum mismatch".to_string()));
        }

        let name_len = usize::from(framed[MAGIC.len()]);
        let name_end = header_len + name_len;
        if framed.len() < name_end + 1 {
            return Err(corrupt("truncated header".to_string()));
        }
        let name = &framed[header_len..name_end];
        if name != self.name.as_bytes() {
            return Err(corrupt(format!(
                "expected {} document, found {}",
                self.name,
                String::from_utf8_lossy(name)
            )));
        }

        let flags = framed[name_end];
        let codec = match flags {
            0 => Codec::None,
            FLAG_LZ4 => Codec::Lz4,
            other => return Err(corrupt(format!("unknown flags {other:#04x}"))),
        };
        codec
            .decompress(&framed[name_end + 1..])
            .map_err(|reason| corrupt(format!("decompression failed: {reason}")))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case(Codec::None)]
    #[test_case(Codec::Lz4)]
    fn encode_decode(codec: Codec) {
        let body = br#"{"snapshots":[],"indices":{}}"#.repeat(10);
        let blob = INDEX_N_FORMAT.encode(&body, codec);
        assert_eq!(INDEX_N_FORMAT.decode("repo", "index-0", &blob).unwrap(), body);
    }

    #[test]
    fn lz4_shrinks_repetitive_documents() {
        let body = vec![b'a'; 10_000];
        let plain = SNAPSHOT_FORMAT.encode(&body, Codec::None);
        let compressed = SNAPSHOT_FORMAT.encode(&body, Codec::Lz4);
        assert!(compressed.len() < plain.len());
    }

    #[test]
    fn wrong_document_kind_is_corrupt() {
        let blob = SNAPSHOT_FORMAT.encode(b"{}", Codec::None);
        let err = INDEX_N_FORMAT.decode("repo", "index-0", &blob).unwrap_err();
        assert!(matches!(err, RepositoryError::CorruptState { .. }));
    }

    #[test]
    fn truncated_blob_is_corrupt() {
        let blob = INDEX_N_FORMAT.encode(b"{\"a\":1}", Codec::None);
        let err = INDEX_N_FORMAT
            .decode("repo", "index-0", &blob[..blob.len() - 5])
            .unwrap_err();
        assert!(matches!(err, RepositoryError::CorruptState { .. }));
    }

    proptest! {
        /// Property: Flipping any byte is detected
        #[test]
        fn prop_any_bit_flip_is_detected(
            body in proptest::collection::vec(any::<u8>(), 1..256),
            position in any::<prop::sample::Index>(),
            mask in 1u8..=255,
        ) {
            let mut blob = INDEX_N_FORMAT.encode(&body, Codec::None).to_vec();
            let i = position.index(blob.len());
            blob[i] ^= mask;
            prop_assert!(INDEX_N_FORMAT.decode("repo", "index-0", &blob).is_err());
        }
    }
}
