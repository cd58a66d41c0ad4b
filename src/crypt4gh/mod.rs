//! Crypt4GH container handling.
//!
//! The archive keeps file bodies and headers apart: the metadata store holds
//! the sealed header and the object store holds the segmented ciphertext
//! body. Neither half is a valid Crypt4GH stream on its own, so everything
//! here works on the two pieces and joins them at read time.
//!
//! - [`keys`] loads the server's long-term X25519 key from its armored file
//! - [`header`] seals, unseals and reseals header packets
//! - [`stream`] builds the per-request readers (decrypting or pass-through)

pub mod header;
pub mod keys;
pub mod stream;

pub use header::DecryptedHeader;
pub use stream::{DecryptStream, RawStream, SEGMENT_SIZE};

/// Magic bytes opening every Crypt4GH stream.
pub const MAGIC: &[u8; 8] = b"crypt4gh";

/// Container format version.
pub const VERSION: u32 = 1;

pub type Result<T> = std::result::Result<T, C4ghError>;

#[derive(Debug, thiserror::Error)]
pub enum C4ghError {
    #[error("not a crypt4gh stream")]
    BadMagic,

    #[error("unsupported container version {0}")]
    BadVersion(u32),

    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("no header packet could be opened with the supplied key")]
    NoMatchingKey,

    #[error("malformed private key file: {0}")]
    MalformedKeyFile(&'static str),

    #[error("unsupported key derivation function {0}")]
    UnsupportedKdf(String),

    #[error("unsupported key cipher {0}")]
    UnsupportedKeyCipher(String),

    #[error("segment decryption failed")]
    SegmentDecrypt,

    #[error("truncated data segment")]
    TruncatedSegment,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<C4ghError> for crate::Error {
    fn from(err: C4ghError) -> Self {
        crate::Error::Stream(err.to_string())
    }
}

pub(crate) fn read_u32_le(buf: &[u8], at: usize) -> Result<u32> {
    let bytes: [u8; 4] = buf
        .get(at..at + 4)
        .ok_or(C4ghError::MalformedHeader("unexpected end of data"))?
        .try_into()
        .expect("slice length checked");
    Ok(u32::from_le_bytes(bytes))
}
