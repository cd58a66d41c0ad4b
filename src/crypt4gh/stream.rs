//! Streaming readers over Crypt4GH bodies.
//!
//! The archive stores the segmented ciphertext body only; the header comes
//! from the metadata store. [`stitch`] joins the two into one readable
//! sequence for pass-through downloads, and [`DecryptStream`] yields
//! plaintext from a body given an unsealed header, honoring skip/keep edits
//! so byte ranges never require buffering the file.

use bytes::Bytes;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::VecDeque;
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{header::DecryptedHeader, C4ghError, Result};

/// Plaintext bytes per segment.
pub const SEGMENT_SIZE: usize = 64_000;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// On-the-wire bytes per full segment.
pub const CIPHER_SEGMENT_SIZE: usize = NONCE_LEN + SEGMENT_SIZE + TAG_LEN;

/// Copy granularity towards the response writer.
const CHUNK_SIZE: usize = 4096;

/// Join persisted header bytes with an archive body reader.
pub fn stitch<R>(header: Vec<u8>, body: R) -> impl AsyncRead + Send + Unpin
where
    R: AsyncRead + Send + Unpin,
{
    AsyncReadExt::chain(Cursor::new(header), body)
}

/// Smallest pass-through cutoff that still contains plaintext byte `end`.
///
/// Pass-through responses are trimmed on segment boundaries: the cutoff
/// covers every segment touched by the requested plaintext window, plus the
/// header that precedes the body.
pub fn encrypted_end(header_len: u64, start: u64, end: u64, archive_size: u64) -> u64 {
    let body_bytes_needed = (end - start).saturating_sub(header_len);
    let segments = body_bytes_needed.div_ceil(SEGMENT_SIZE as u64);
    archive_size.min((SEGMENT_SIZE as u64).saturating_mul(segments)) + header_len
}

/// Seal plaintext into a segmented body.
///
/// Counterpart of [`DecryptStream`]; used when resealing fixtures and by the
/// test suites. Each segment gets a fresh random nonce.
pub fn seal(plaintext: &[u8], data_key: &[u8; 32]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(data_key));
    let mut body = Vec::with_capacity(
        plaintext.len() + (plaintext.len() / SEGMENT_SIZE + 1) * (NONCE_LEN + TAG_LEN),
    );
    for segment in plaintext.chunks(SEGMENT_SIZE) {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), segment)
            .expect("chacha20-poly1305 sealing cannot fail");
        body.extend_from_slice(&nonce);
        body.extend_from_slice(&sealed);
    }
    body
}

/// Pass-through chunker for raw (still encrypted) downloads.
pub struct RawStream<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> RawStream<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next chunk of at most 4 KiB, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.inner.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(Bytes::from(buf)))
    }
}

/// Skip/keep plan over the plaintext, derived from a request range or from a
/// stored edit list. Lengths alternate starting with a skip; a list with an
/// odd number of entries keeps everything after the final skip.
#[derive(Debug)]
enum EditPlan {
    /// No edits: emit the whole plaintext.
    All,
    Edits {
        lengths: VecDeque<u64>,
        skipping: bool,
        tail_keep: bool,
    },
}

impl EditPlan {
    fn from_lengths(lengths: &[u64]) -> Self {
        EditPlan::Edits {
            tail_keep: lengths.len() % 2 == 1,
            lengths: lengths.iter().copied().collect(),
            skipping: true,
        }
    }

    fn from_range(start: u64, end: Option<u64>) -> Self {
        match end {
            Some(end) => EditPlan::from_lengths(&[start, end - start]),
            None => EditPlan::from_lengths(&[start]),
        }
    }
}

/// Decrypting reader over a Crypt4GH body.
///
/// Pulls whole segments from the underlying reader, decrypts them with the
/// header's segment key and hands out plaintext in ≤4 KiB chunks. Segments
/// that fall entirely inside a skip region are discarded without
/// decryption.
pub struct DecryptStream<R> {
    body: R,
    keys: Vec<[u8; 32]>,
    preferred_key: usize,
    plan: EditPlan,
    seg_buf: Vec<u8>,
    out: Vec<u8>,
    out_pos: usize,
    finished: bool,
}

impl<R: AsyncRead + Unpin> DecryptStream<R> {
    /// Build a reader from an unsealed header and the body.
    ///
    /// `range` is a decrypted-coordinate window `(start, end)`; when given it
    /// replaces any edit list stored in the header.
    pub fn new(header: &DecryptedHeader, body: R, range: Option<(u64, Option<u64>)>) -> Self {
        let plan = match range {
            Some((start, end)) => EditPlan::from_range(start, end),
            None => match &header.edit_list {
                Some(lengths) => EditPlan::from_lengths(lengths),
                None => EditPlan::All,
            },
        };
        Self {
            body,
            keys: header.data_keys.clone(),
            preferred_key: 0,
            plan,
            seg_buf: vec![0u8; CIPHER_SEGMENT_SIZE],
            out: Vec::new(),
            out_pos: 0,
            finished: false,
        }
    }

    /// Next plaintext chunk of at most 4 KiB, `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.out_pos < self.out.len() {
                let end = (self.out_pos + CHUNK_SIZE).min(self.out.len());
                let chunk = Bytes::copy_from_slice(&self.out[self.out_pos..end]);
                self.out_pos = end;
                if self.out_pos == self.out.len() {
                    self.out.clear();
                    self.out_pos = 0;
                }
                return Ok(Some(chunk));
            }
            if self.finished {
                return Ok(None);
            }

            if self.whole_segment_skippable() {
                let n = self.fill_segment().await?;
                if n == 0 {
                    self.finished = true;
                    return Ok(None);
                }
                if n == CIPHER_SEGMENT_SIZE {
                    // Fully skipped: no need to authenticate or decrypt.
                    self.consume_skip(SEGMENT_SIZE as u64);
                    continue;
                }
                // Short trailing segment; fall through to a normal decrypt.
                let plain = self.decrypt_segment(n)?;
                self.apply_edits(&plain);
                continue;
            }

            let n = self.fill_segment().await?;
            if n == 0 {
                self.finished = true;
                return Ok(None);
            }
            let plain = self.decrypt_segment(n)?;
            self.apply_edits(&plain);
        }
    }

    fn whole_segment_skippable(&self) -> bool {
        match &self.plan {
            EditPlan::Edits {
                lengths, skipping, ..
            } => *skipping && lengths.front().is_some_and(|n| *n >= SEGMENT_SIZE as u64),
            EditPlan::All => false,
        }
    }

    fn consume_skip(&mut self, amount: u64) {
        if let EditPlan::Edits {
            lengths, skipping, ..
        } = &mut self.plan
        {
            if let Some(front) = lengths.front_mut() {
                *front -= amount;
                if *front == 0 {
                    lengths.pop_front();
                    *skipping = false;
                }
            }
        }
    }

    /// Read until a full cipher segment is buffered or the body ends.
    async fn fill_segment(&mut self) -> Result<usize> {
        let mut filled = 0;
        while filled < CIPHER_SEGMENT_SIZE {
            let n = self.body.read(&mut self.seg_buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn decrypt_segment(&mut self, n: usize) -> Result<Vec<u8>> {
        if n < NONCE_LEN + TAG_LEN {
            return Err(C4ghError::TruncatedSegment);
        }
        let nonce = Nonce::from_slice(&self.seg_buf[..NONCE_LEN]);
        let sealed = &self.seg_buf[NONCE_LEN..n];

        // The preferred key is whichever one opened the previous segment.
        let order = (0..self.keys.len())
            .map(|i| (self.preferred_key + i) % self.keys.len())
            .collect::<Vec<_>>();
        for idx in order {
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.keys[idx]));
            if let Ok(plain) = cipher.decrypt(nonce, sealed) {
                self.preferred_key = idx;
                return Ok(plain);
            }
        }
        Err(C4ghError::SegmentDecrypt)
    }

    /// Run one decrypted segment through the skip/keep plan.
    fn apply_edits(&mut self, plain: &[u8]) {
        match &mut self.plan {
            EditPlan::All => self.out.extend_from_slice(plain),
            EditPlan::Edits {
                lengths,
                skipping,
                tail_keep,
            } => {
                let mut off = 0usize;
                while off < plain.len() {
                    let Some(front) = lengths.front_mut() else {
                        if *tail_keep {
                            self.out.extend_from_slice(&plain[off..]);
                        } else {
                            self.finished = true;
                        }
                        return;
                    };
                    let take = (*front).min((plain.len() - off) as u64) as usize;
                    if !*skipping {
                        self.out.extend_from_slice(&plain[off..off + take]);
                    }
                    off += take;
                    *front -= take as u64;
                    if *front == 0 {
                        lengths.pop_front();
                        *skipping = !*skipping;
                    }
                }
                // Nothing left to keep: stop pulling segments.
                if lengths.is_empty() && !*tail_keep {
                    self.finished = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt4gh::header;
    use crate::crypt4gh::keys::generate_keypair;

    fn data_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn drain<R: AsyncRead + Unpin>(mut stream: DecryptStream<R>) -> Vec<u8> {
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next_chunk().await.unwrap() {
            assert!(chunk.len() <= 4096);
            collected.extend_from_slice(&chunk);
        }
        collected
    }

    fn opened_header(key: [u8; 32]) -> DecryptedHeader {
        DecryptedHeader {
            data_keys: vec![key],
            edit_list: None,
        }
    }

    #[tokio::test]
    async fn test_full_roundtrip_multi_segment() {
        let key = data_key();
        let plain = plaintext(150_000);
        let body = seal(&plain, &key);
        assert_eq!(body.len(), 150_000 + 3 * (NONCE_LEN + TAG_LEN));

        let stream = DecryptStream::new(&opened_header(key), Cursor::new(body), None);
        assert_eq!(drain(stream).await, plain);
    }

    #[tokio::test]
    async fn test_range_within_one_segment() {
        let key = data_key();
        let plain = plaintext(32);
        let body = seal(&plain, &key);

        let stream =
            DecryptStream::new(&opened_header(key), Cursor::new(body), Some((10, Some(20))));
        assert_eq!(drain(stream).await, &plain[10..20]);
    }

    #[tokio::test]
    async fn test_range_across_segments() {
        let key = data_key();
        let plain = plaintext(200_000);
        let body = seal(&plain, &key);

        let stream = DecryptStream::new(
            &opened_header(key),
            Cursor::new(body),
            Some((63_990, Some(128_010))),
        );
        assert_eq!(drain(stream).await, &plain[63_990..128_010]);
    }

    #[tokio::test]
    async fn test_range_skipping_whole_segments() {
        let key = data_key();
        let plain = plaintext(300_000);
        let body = seal(&plain, &key);

        // Start lands in the fourth segment; the first three are discarded
        // without decryption.
        let stream = DecryptStream::new(
            &opened_header(key),
            Cursor::new(body),
            Some((192_100, Some(192_200))),
        );
        assert_eq!(drain(stream).await, &plain[192_100..192_200]);
    }

    #[tokio::test]
    async fn test_open_ended_range() {
        let key = data_key();
        let plain = plaintext(70_000);
        let body = seal(&plain, &key);

        let stream = DecryptStream::new(&opened_header(key), Cursor::new(body), Some((65_000, None)));
        assert_eq!(drain(stream).await, &plain[65_000..]);
    }

    #[tokio::test]
    async fn test_stored_edit_list_is_honored() {
        let key = data_key();
        let plain = plaintext(1000);
        let body = seal(&plain, &key);
        let header = DecryptedHeader {
            data_keys: vec![key],
            edit_list: Some(vec![100, 50]),
        };

        let stream = DecryptStream::new(&header, Cursor::new(body), None);
        assert_eq!(drain(stream).await, &plain[100..150]);
    }

    #[tokio::test]
    async fn test_request_range_overrides_stored_edit_list() {
        let key = data_key();
        let plain = plaintext(1000);
        let body = seal(&plain, &key);
        let header = DecryptedHeader {
            data_keys: vec![key],
            edit_list: Some(vec![100, 50]),
        };

        let stream = DecryptStream::new(&header, Cursor::new(body), Some((0, Some(10))));
        assert_eq!(drain(stream).await, &plain[..10]);
    }

    #[tokio::test]
    async fn test_wrong_key_fails() {
        let key = data_key();
        let body = seal(&plaintext(100), &key);

        let mut stream = DecryptStream::new(&opened_header(data_key()), Cursor::new(body), None);
        assert!(matches!(
            stream.next_chunk().await,
            Err(C4ghError::SegmentDecrypt)
        ));
    }

    #[tokio::test]
    async fn test_empty_body() {
        let key = data_key();
        let mut stream =
            DecryptStream::new(&opened_header(key), Cursor::new(Vec::new()), None);
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_recipient_key_opens_segments() {
        let (reader_sk, reader_pk) = generate_keypair();
        let (writer_sk, _) = generate_keypair();
        let key = data_key();
        let plain = plaintext(100);
        let body = seal(&plain, &key);

        let sealed_header = header::serialize(&key, None, &writer_sk, &[reader_pk]).unwrap();
        let opened = header::deconstruct(&sealed_header, &reader_sk).unwrap();

        let stream = DecryptStream::new(&opened, Cursor::new(body), None);
        assert_eq!(drain(stream).await, plain);
    }

    #[test]
    fn test_encrypted_end_padding() {
        // 124-byte header, one-megabyte window over a two-megabyte body:
        // sixteen segments plus the header.
        assert_eq!(encrypted_end(124, 0, 1_000_000, 2_000_000), 1_024_124);
        // Window inside the header: no body segments at all.
        assert_eq!(encrypted_end(124, 0, 100, 2_000_000), 124);
        // Cutoff never exceeds the archive size.
        assert_eq!(
            encrypted_end(124, 0, u64::MAX, 2_000_000),
            2_000_000 + 124
        );
    }

    #[tokio::test]
    async fn test_raw_stream_chunks() {
        let body = plaintext(10_000);
        let mut raw = RawStream::new(Cursor::new(body.clone()));
        let mut collected = Vec::new();
        while let Some(chunk) = raw.next_chunk().await.unwrap() {
            assert!(chunk.len() <= 4096);
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, body);
    }

    #[tokio::test]
    async fn test_stitch_prepends_header() {
        let stitched = stitch(vec![1, 2, 3], Cursor::new(vec![4, 5]));
        let mut collected = Vec::new();
        let mut reader = stitched;
        reader.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, vec![1, 2, 3, 4, 5]);
    }
}
