//! Crypt4GH key file handling.
//!
//! The server holds one long-term X25519 key pair. The private key lives in
//! an armored `c4gh-v1` file, optionally sealed with a passphrase-derived
//! key (scrypt + ChaCha20-Poly1305, the format's standard combination).

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{C4ghError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

const KEY_MAGIC: &[u8; 7] = b"c4gh-v1";
const KDF_NONE: &str = "none";
const KDF_SCRYPT: &str = "scrypt";
const CIPHER_NONE: &str = "none";
const CIPHER_CHACHA: &str = "chacha20_poly1305";

// scrypt parameters fixed by the format: N = 2^14, r = 8, p = 1.
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Generate a fresh X25519 key pair, returned as (private, public) bytes.
pub fn generate_keypair() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key for a private key.
pub fn public_key(private: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*private)).to_bytes()
}

/// Read and unseal a private key from an armored `c4gh-v1` file.
pub fn load_private_key(path: &Path, passphrase: &str) -> Result<[u8; 32]> {
    let content = std::fs::read_to_string(path)?;
    decode_private_key(&content, passphrase)
}

/// Unseal a private key from armored text.
pub fn decode_private_key(armored: &str, passphrase: &str) -> Result<[u8; 32]> {
    let body: String = armored
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    let payload = BASE64
        .decode(body.as_bytes())
        .map_err(|_| C4ghError::MalformedKeyFile("invalid base64 payload"))?;

    if payload.len() < KEY_MAGIC.len() || &payload[..KEY_MAGIC.len()] != KEY_MAGIC {
        return Err(C4ghError::MalformedKeyFile("missing c4gh-v1 magic"));
    }

    let mut at = KEY_MAGIC.len();
    let kdfname = read_string(&payload, &mut at)?;
    let kdf = std::str::from_utf8(&kdfname)
        .map_err(|_| C4ghError::MalformedKeyFile("kdf name is not utf-8"))?
        .to_string();

    let mut salt = Vec::new();
    if kdf != KDF_NONE {
        let options = read_string(&payload, &mut at)?;
        if options.len() < 4 {
            return Err(C4ghError::MalformedKeyFile("short kdf options"));
        }
        // u32 BE rounds, unused by scrypt, then the salt.
        salt = options[4..].to_vec();
    }

    let ciphername = read_string(&payload, &mut at)?;
    let cipher = std::str::from_utf8(&ciphername)
        .map_err(|_| C4ghError::MalformedKeyFile("cipher name is not utf-8"))?
        .to_string();
    let data = read_string(&payload, &mut at)?;

    match cipher.as_str() {
        CIPHER_NONE => {
            let key: [u8; 32] = data
                .as_slice()
                .try_into()
                .map_err(|_| C4ghError::MalformedKeyFile("bad key length"))?;
            Ok(key)
        }
        CIPHER_CHACHA => {
            if kdf != KDF_SCRYPT {
                return Err(C4ghError::UnsupportedKdf(kdf));
            }
            if data.len() != 12 + 32 + 16 {
                return Err(C4ghError::MalformedKeyFile("bad sealed key length"));
            }
            let kek = derive_kek(passphrase, &salt)?;
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&kek));
            let plain = cipher
                .decrypt(Nonce::from_slice(&data[..12]), &data[12..])
                .map_err(|_| C4ghError::MalformedKeyFile("passphrase rejected"))?;
            let key: [u8; 32] = plain
                .as_slice()
                .try_into()
                .map_err(|_| C4ghError::MalformedKeyFile("bad key length"))?;
            Ok(key)
        }
        other => Err(C4ghError::UnsupportedKeyCipher(other.to_string())),
    }
}

/// Seal a private key into armored `c4gh-v1` text.
///
/// An empty passphrase writes the key in the clear; otherwise the key is
/// sealed with scrypt + ChaCha20-Poly1305.
pub fn encode_private_key(private: &[u8; 32], passphrase: &str) -> Result<String> {
    let mut payload = Vec::new();
    payload.extend_from_slice(KEY_MAGIC);

    if passphrase.is_empty() {
        write_string(&mut payload, KDF_NONE.as_bytes());
        write_string(&mut payload, CIPHER_NONE.as_bytes());
        write_string(&mut payload, private);
    } else {
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        let mut options = Vec::with_capacity(4 + salt.len());
        options.extend_from_slice(&(1u32 << SCRYPT_LOG_N).to_be_bytes());
        options.extend_from_slice(&salt);

        write_string(&mut payload, KDF_SCRYPT.as_bytes());
        write_string(&mut payload, &options);
        write_string(&mut payload, CIPHER_CHACHA.as_bytes());

        let kek = derive_kek(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&kek));
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), private.as_slice())
            .map_err(|_| C4ghError::MalformedKeyFile("key sealing failed"))?;

        let mut data = Vec::with_capacity(12 + sealed.len());
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&sealed);
        write_string(&mut payload, &data);
    }

    let label = if passphrase.is_empty() {
        "CRYPT4GH PRIVATE KEY"
    } else {
        "CRYPT4GH ENCRYPTED PRIVATE KEY"
    };
    Ok(format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        BASE64.encode(&payload)
    ))
}

fn derive_kek(passphrase: &str, salt: &[u8]) -> Result<[u8; 32]> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32)
        .map_err(|_| C4ghError::MalformedKeyFile("bad scrypt parameters"))?;
    let mut kek = [0u8; 32];
    scrypt::scrypt(passphrase.as_bytes(), salt, &params, &mut kek)
        .map_err(|_| C4ghError::MalformedKeyFile("scrypt derivation failed"))?;
    Ok(kek)
}

/// Length-prefixed (u16 BE) byte string, the key file's framing.
fn read_string(payload: &[u8], at: &mut usize) -> Result<Vec<u8>> {
    let len_bytes: [u8; 2] = payload
        .get(*at..*at + 2)
        .ok_or(C4ghError::MalformedKeyFile("unexpected end of payload"))?
        .try_into()
        .expect("slice length checked");
    let len = u16::from_be_bytes(len_bytes) as usize;
    *at += 2;
    let value = payload
        .get(*at..*at + len)
        .ok_or(C4ghError::MalformedKeyFile("unexpected end of payload"))?
        .to_vec();
    *at += len;
    Ok(value)
}

fn write_string(payload: &mut Vec<u8>, value: &[u8]) {
    payload.extend_from_slice(&(value.len() as u16).to_be_bytes());
    payload.extend_from_slice(value);
}
