//! Header packet sealing and unsealing.
//!
//! A header is `crypt4gh` magic, a version word, a packet count and a run of
//! encrypted packets. Each packet is sealed to one recipient with a key
//! agreed via X25519 and hashed with BLAKE2b-512 over
//! `shared ‖ writer_pk ‖ reader_pk` (the libsodium `crypto_kx` session-key
//! construction); the second half of the hash keys ChaCha20-Poly1305.
//!
//! Packets carry either data-encryption parameters (the 32-byte segment key)
//! or a data edit list (alternating skip/keep lengths over the plaintext).

use blake2::{Blake2b512, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{read_u32_le, C4ghError, Result, MAGIC, VERSION};

const X25519_CHACHA20_IETF_POLY1305: u32 = 0;
const CHACHA20_IETF_POLY1305: u32 = 0;

const PACKET_DATA_ENC: u32 = 0;
const PACKET_EDIT_LIST: u32 = 1;

/// Preamble length: magic + version + packet count.
const PREAMBLE_LEN: usize = 16;
/// Fixed per-packet overhead: length + method + writer key + nonce + tag.
const PACKET_OVERHEAD: usize = 4 + 4 + 32 + 12 + 16;

/// Header contents after unsealing.
#[derive(Debug, Clone)]
pub struct DecryptedHeader {
    /// Candidate segment keys, in packet order. Several appear when the file
    /// was sealed for multiple recipients sharing one body.
    pub data_keys: Vec<[u8; 32]>,
    /// Alternating skip/keep plaintext lengths, when the header carries one.
    pub edit_list: Option<Vec<u64>>,
}

/// Unseal a header with the reader's private key.
///
/// Packets sealed to other recipients are skipped. At least one
/// data-encryption packet must open, otherwise the reader key simply cannot
/// decrypt this file.
pub fn deconstruct(header: &[u8], reader_sk: &[u8; 32]) -> Result<DecryptedHeader> {
    let packets = split_packets(header)?;
    let reader_pk = super::keys::public_key(reader_sk);

    let mut data_keys = Vec::new();
    let mut edit_list = None;

    for packet in packets {
        let Some(content) = open_packet(packet, reader_sk, &reader_pk)? else {
            continue;
        };
        match read_u32_le(&content, 0)? {
            PACKET_DATA_ENC => {
                if read_u32_le(&content, 4)? != CHACHA20_IETF_POLY1305 {
                    return Err(C4ghError::MalformedHeader("unknown data encryption method"));
                }
                let key: [u8; 32] = content
                    .get(8..40)
                    .ok_or(C4ghError::MalformedHeader("short data encryption packet"))?
                    .try_into()
                    .expect("slice length checked");
                data_keys.push(key);
            }
            PACKET_EDIT_LIST => {
                let count = read_u32_le(&content, 4)? as usize;
                let mut lengths = Vec::with_capacity(count);
                for i in 0..count {
                    let at = 8 + i * 8;
                    let bytes: [u8; 8] = content
                        .get(at..at + 8)
                        .ok_or(C4ghError::MalformedHeader("short edit list packet"))?
                        .try_into()
                        .expect("slice length checked");
                    lengths.push(u64::from_le_bytes(bytes));
                }
                // The format permits at most one edit list; first wins.
                if edit_list.is_none() {
                    edit_list = Some(lengths);
                }
            }
            _ => {
                // Unknown packet types round-trip without failure.
            }
        }
    }

    if data_keys.is_empty() {
        return Err(C4ghError::NoMatchingKey);
    }

    Ok(DecryptedHeader {
        data_keys,
        edit_list,
    })
}

/// Seal a header for a set of recipients.
///
/// One data-encryption packet is written per recipient, followed by an
/// optional shared edit-list packet sealed to the first recipient.
pub fn serialize(
    data_key: &[u8; 32],
    edit_list: Option<&[u64]>,
    writer_sk: &[u8; 32],
    recipients: &[[u8; 32]],
) -> Result<Vec<u8>> {
    if recipients.is_empty() {
        return Err(C4ghError::MalformedHeader("no recipients"));
    }

    let mut packets = Vec::new();
    for recipient in recipients {
        let mut content = Vec::with_capacity(40);
        content.extend_from_slice(&PACKET_DATA_ENC.to_le_bytes());
        content.extend_from_slice(&CHACHA20_IETF_POLY1305.to_le_bytes());
        content.extend_from_slice(data_key);
        packets.push(seal_packet(&content, writer_sk, recipient)?);
    }
    if let Some(lengths) = edit_list {
        let mut content = Vec::with_capacity(8 + lengths.len() * 8);
        content.extend_from_slice(&PACKET_EDIT_LIST.to_le_bytes());
        content.extend_from_slice(&(lengths.len() as u32).to_le_bytes());
        for length in lengths {
            content.extend_from_slice(&length.to_le_bytes());
        }
        packets.push(seal_packet(&content, writer_sk, &recipients[0])?);
    }

    let mut header = Vec::with_capacity(PREAMBLE_LEN + packets.iter().map(Vec::len).sum::<usize>());
    header.extend_from_slice(MAGIC);
    header.extend_from_slice(&VERSION.to_le_bytes());
    header.extend_from_slice(&(packets.len() as u32).to_le_bytes());
    for packet in packets {
        header.extend_from_slice(&packet);
    }
    Ok(header)
}

/// Reseal a header to a new recipient.
///
/// Opens the header with the reader key, then writes a fresh header carrying
/// the same segment key and edit list, sealed to `recipient_pk` with an
/// ephemeral writer key. The body stays untouched.
pub fn reencrypt(header: &[u8], reader_sk: &[u8; 32], recipient_pk: &[u8; 32]) -> Result<Vec<u8>> {
    let opened = deconstruct(header, reader_sk)?;
    let ephemeral = StaticSecret::random_from_rng(OsRng).to_bytes();
    serialize(
        &opened.data_keys[0],
        opened.edit_list.as_deref(),
        &ephemeral,
        &[*recipient_pk],
    )
}

/// Split raw header bytes into encrypted packet slices.
fn split_packets(header: &[u8]) -> Result<Vec<&[u8]>> {
    if header.len() < PREAMBLE_LEN {
        return Err(C4ghError::MalformedHeader("short preamble"));
    }
    if &header[..8] != MAGIC {
        return Err(C4ghError::BadMagic);
    }
    let version = read_u32_le(header, 8)?;
    if version != VERSION {
        return Err(C4ghError::BadVersion(version));
    }
    let count = read_u32_le(header, 12)? as usize;

    let mut packets = Vec::with_capacity(count);
    let mut at = PREAMBLE_LEN;
    for _ in 0..count {
        let length = read_u32_le(header, at)? as usize;
        if length < PACKET_OVERHEAD {
            return Err(C4ghError::MalformedHeader("packet shorter than overhead"));
        }
        let packet = header
            .get(at..at + length)
            .ok_or(C4ghError::MalformedHeader("packet overruns header"))?;
        packets.push(packet);
        at += length;
    }
    Ok(packets)
}

/// Try to open one encrypted packet; `None` when it is sealed to someone else.
fn open_packet(packet: &[u8], reader_sk: &[u8; 32], reader_pk: &[u8; 32]) -> Result<Option<Vec<u8>>> {
    if read_u32_le(packet, 4)? != X25519_CHACHA20_IETF_POLY1305 {
        // Unknown sealing method, not for us.
        return Ok(None);
    }
    let writer_pk: [u8; 32] = packet[8..40].try_into().expect("overhead checked");
    let nonce = &packet[40..52];
    let sealed = &packet[52..];

    let key = session_key(reader_sk, &writer_pk, &writer_pk, reader_pk);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    match cipher.decrypt(Nonce::from_slice(nonce), sealed) {
        Ok(content) => Ok(Some(content)),
        Err(_) => Ok(None),
    }
}

fn seal_packet(content: &[u8], writer_sk: &[u8; 32], recipient_pk: &[u8; 32]) -> Result<Vec<u8>> {
    let writer_pk = super::keys::public_key(writer_sk);
    let key = session_key(writer_sk, recipient_pk, &writer_pk, recipient_pk);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), content)
        .map_err(|_| C4ghError::MalformedHeader("packet sealing failed"))?;

    let length = PACKET_OVERHEAD + content.len();
    let mut packet = Vec::with_capacity(length);
    packet.extend_from_slice(&(length as u32).to_le_bytes());
    packet.extend_from_slice(&X25519_CHACHA20_IETF_POLY1305.to_le_bytes());
    packet.extend_from_slice(&writer_pk);
    packet.extend_from_slice(&nonce);
    packet.extend_from_slice(&sealed);
    Ok(packet)
}

/// `crypto_kx` session key: BLAKE2b-512(shared ‖ writer_pk ‖ reader_pk),
/// second half. The writer's transmit key equals the reader's receive key.
fn session_key(
    own_sk: &[u8; 32],
    peer_pk: &[u8; 32],
    writer_pk: &[u8; 32],
    reader_pk: &[u8; 32],
) -> [u8; 32] {
    let shared = StaticSecret::from(*own_sk)
        .diffie_hellman(&PublicKey::from(*peer_pk))
        .to_bytes();
    let digest = Blake2b512::new()
        .chain_update(shared)
        .chain_update(writer_pk)
        .chain_update(reader_pk)
        .finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest[32..64]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt4gh::keys::generate_keypair;

    fn data_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        key
    }

    #[test]
    fn test_single_recipient_roundtrip() {
        let (reader_sk, reader_pk) = generate_keypair();
        let (writer_sk, _) = generate_keypair();
        let key = data_key();

        let header = serialize(&key, None, &writer_sk, &[reader_pk]).unwrap();
        // magic + version + count + one 108-byte data packet
        assert_eq!(header.len(), 124);

        let opened = deconstruct(&header, &reader_sk).unwrap();
        assert_eq!(opened.data_keys, vec![key]);
        assert!(opened.edit_list.is_none());
    }

    #[test]
    fn test_edit_list_roundtrip() {
        let (reader_sk, reader_pk) = generate_keypair();
        let (writer_sk, _) = generate_keypair();
        let key = data_key();

        let header = serialize(&key, Some(&[100, 2000]), &writer_sk, &[reader_pk]).unwrap();
        let opened = deconstruct(&header, &reader_sk).unwrap();
        assert_eq!(opened.edit_list, Some(vec![100, 2000]));
    }

    #[test]
    fn test_foreign_packets_are_skipped() {
        let (reader_sk, reader_pk) = generate_keypair();
        let (_, stranger_pk) = generate_keypair();
        let (writer_sk, _) = generate_keypair();
        let key = data_key();

        let header = serialize(&key, None, &writer_sk, &[stranger_pk, reader_pk]).unwrap();
        let opened = deconstruct(&header, &reader_sk).unwrap();
        assert_eq!(opened.data_keys, vec![key]);
    }

    #[test]
    fn test_wrong_key_cannot_open() {
        let (_, reader_pk) = generate_keypair();
        let (stranger_sk, _) = generate_keypair();
        let (writer_sk, _) = generate_keypair();

        let header = serialize(&data_key(), None, &writer_sk, &[reader_pk]).unwrap();
        assert!(matches!(
            deconstruct(&header, &stranger_sk),
            Err(C4ghError::NoMatchingKey)
        ));
    }

    #[test]
    fn test_reencrypt_moves_recipient() {
        let (server_sk, server_pk) = generate_keypair();
        let (client_sk, client_pk) = generate_keypair();
        let (writer_sk, _) = generate_keypair();
        let key = data_key();

        let header = serialize(&key, Some(&[7]), &writer_sk, &[server_pk]).unwrap();
        let resealed = reencrypt(&header, &server_sk, &client_pk).unwrap();

        let opened = deconstruct(&resealed, &client_sk).unwrap();
        assert_eq!(opened.data_keys, vec![key]);
        assert_eq!(opened.edit_list, Some(vec![7]));
        // The server can no longer open the resealed header.
        assert!(deconstruct(&resealed, &server_sk).is_err());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let (reader_sk, _) = generate_keypair();
        assert!(matches!(
            deconstruct(b"not4gh!!rest-of-header", &reader_sk),
            Err(C4ghError::BadMagic)
        ));
    }
}
