//! Key exchange and per-packet payload encryption.
//!
//! Every endpoint owns one RSA-1024 keypair, used only during the handshake: the
//!  server's public key travels to the client encrypted under the client's public key,
//!  and the client's freshly generated 32-byte session key travels back encrypted under
//!  the server's. From then on each DATA payload is encrypted symmetrically with a key
//!  derived from the session key and the packet id, so no two packets share a key.
//!
//! The symmetric cipher adapts to the payload length: short payloads (up to 64 bytes)
//!  are XOR-ed with the derived key, longer ones use AES-256-GCM with a random nonce
//!  prepended to the ciphertext.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail};
use bytes::Bytes;
use md5::Md5;
use rand::RngCore;
use rsa::pkcs8::{DecodePublicKey, Document, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::sync::{Arc, RwLock};
use tracing::error;

use crate::packet::PacketId;

const RSA_BIT_SIZE: usize = 1024;

/// OAEP input chunk size on encrypt; bounded by the 1024-bit modulus minus padding.
const RSA_ENCRYPT_CHUNK: usize = 62;

/// OAEP ciphertext chunk size on decrypt: one full 1024-bit modulus.
const RSA_DECRYPT_CHUNK: usize = 128;

const PUBLIC_KEY_PEM_LABEL: &str = "RSA PUBLIC KEY";

pub(crate) const SESSION_KEY_LEN: usize = 32;

/// Payloads up to this length are XOR-encrypted; anything longer uses AES-256-GCM.
const XOR_MAX_LEN: usize = 64;

const AES_NONCE_LEN: usize = 12;

pub(crate) fn generate_private_key() -> anyhow::Result<RsaPrivateKey> {
    Ok(RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_BIT_SIZE)?)
}

/// Serializes a public key as PEM-wrapped PKIX SubjectPublicKeyInfo.
pub(crate) fn public_key_to_pem(key: &RsaPublicKey) -> anyhow::Result<Bytes> {
    let der = key.to_public_key_der()?;
    let pem = der.to_pem(PUBLIC_KEY_PEM_LABEL, LineEnding::LF)?;
    Ok(Bytes::from(pem.into_bytes()))
}

pub(crate) fn public_key_from_pem(pem: &[u8]) -> anyhow::Result<RsaPublicKey> {
    let pem = std::str::from_utf8(pem)?;
    let (_, der) = Document::from_pem(pem).map_err(|e| anyhow!("invalid PEM: {}", e))?;
    Ok(RsaPublicKey::from_public_key_der(der.as_bytes())?)
}

/// RSA-OAEP-SHA256 encryption, splitting the input into chunks small enough for the
///  modulus. The chunks concatenate into a single ciphertext.
pub(crate) fn rsa_encrypt(public_key: &RsaPublicKey, data: &[u8]) -> anyhow::Result<Bytes> {
    let mut out = Vec::with_capacity(data.len().div_ceil(RSA_ENCRYPT_CHUNK) * RSA_DECRYPT_CHUNK);
    for chunk in data.chunks(RSA_ENCRYPT_CHUNK) {
        let encrypted =
            public_key.encrypt(&mut rand::rngs::OsRng, Oaep::new::<Sha256>(), chunk)?;
        out.extend_from_slice(&encrypted);
    }
    Ok(Bytes::from(out))
}

/// Inverse of [`rsa_encrypt`]: decrypts one 128-byte ciphertext chunk at a time.
pub(crate) fn rsa_decrypt(private_key: &RsaPrivateKey, data: &[u8]) -> anyhow::Result<Bytes> {
    let mut out = Vec::new();
    for chunk in data.chunks(RSA_DECRYPT_CHUNK) {
        let decrypted = private_key.decrypt(Oaep::new::<Sha256>(), chunk)?;
        out.extend_from_slice(&decrypted);
    }
    Ok(Bytes::from(out))
}

pub(crate) fn generate_session_key() -> Bytes {
    let mut key = vec![0u8; SESSION_KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    Bytes::from(key)
}

/// Derives the symmetric key for one packet: a hash of `session_key || id_le32`.
///
/// The hash - and with it the key length - is chosen by the payload length, so the
///  XOR path gets a key at least as long as typical short payloads while AES always
///  gets its 32 bytes:
///
/// ```ascii
/// len <= 16   MD5      16-byte key
/// len <= 20   SHA-1    20-byte key
/// len <= 32   SHA-256  32-byte key
/// len <= 64   SHA-512  64-byte key
/// len >  64   SHA-256  32-byte key (AES-256)
/// ```
pub(crate) fn packet_key(session_key: &[u8], id: PacketId, data_len: usize) -> Vec<u8> {
    let mut input = Vec::with_capacity(session_key.len() + 4);
    input.extend_from_slice(session_key);
    input.extend_from_slice(&id.to_raw().to_le_bytes());

    match data_len {
        0..=16 => Md5::digest(&input).to_vec(),
        17..=20 => Sha1::digest(&input).to_vec(),
        21..=32 => Sha256::digest(&input).to_vec(),
        33..=64 => Sha512::digest(&input).to_vec(),
        _ => Sha256::digest(&input).to_vec(),
    }
}

fn xor_in_place(data: &mut [u8], key: &[u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % key.len()];
    }
}

fn aes_encrypt(key: &[u8], data: &[u8]) -> Bytes {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = match cipher.encrypt(&nonce, data) {
        Ok(ciphertext) => ciphertext,
        Err(e) => {
            error!("AES-GCM encryption error: {}", e);
            panic!("AES-GCM encryption error");
        }
    };

    let mut out = Vec::with_capacity(AES_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Bytes::from(out)
}

fn aes_decrypt(key: &[u8], data: &[u8]) -> anyhow::Result<Bytes> {
    if data.len() < AES_NONCE_LEN {
        bail!("AES-GCM ciphertext shorter than the nonce");
    }
    let (nonce, ciphertext) = data.split_at(AES_NONCE_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    match cipher.decrypt(Nonce::from_slice(nonce), ciphertext) {
        Ok(plaintext) => Ok(Bytes::from(plaintext)),
        Err(_) => bail!("AES-GCM decryption failed"),
    }
}

/// A channel's cryptographic state: the endpoint-wide RSA private key plus the
///  session key once the handshake installed it.
pub(crate) struct ChannelCrypt {
    private_key: Arc<RsaPrivateKey>,
    session_key: RwLock<Option<Bytes>>,
}

impl ChannelCrypt {
    pub fn new(private_key: Arc<RsaPrivateKey>) -> ChannelCrypt {
        ChannelCrypt {
            private_key,
            session_key: RwLock::new(None),
        }
    }

    /// True once the handshake has installed the session key; payloads are
    ///  transmitted in the clear until then (handshake payloads only).
    pub fn is_on(&self) -> bool {
        self.session_key.read().unwrap().is_some()
    }

    pub fn install_session_key(&self, key: Bytes) {
        *self.session_key.write().unwrap() = Some(key);
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn encrypt_packet_data(&self, id: PacketId, data: &[u8]) -> Bytes {
        let session_key = self.session_key.read().unwrap();
        let session_key = match session_key.as_ref() {
            Some(key) => key,
            None => return Bytes::copy_from_slice(data),
        };

        let key = packet_key(session_key, id, data.len());
        if data.len() <= XOR_MAX_LEN {
            let mut out = data.to_vec();
            xor_in_place(&mut out, &key);
            Bytes::from(out)
        } else {
            aes_encrypt(&key, data)
        }
    }

    pub fn decrypt_packet_data(&self, id: PacketId, data: &[u8]) -> anyhow::Result<Bytes> {
        let session_key = self.session_key.read().unwrap();
        let session_key = match session_key.as_ref() {
            Some(key) => key,
            None => return Ok(Bytes::copy_from_slice(data)),
        };

        let key = packet_key(session_key, id, data.len());
        if data.len() <= XOR_MAX_LEN {
            let mut out = data.to_vec();
            xor_in_place(&mut out, &key);
            Ok(Bytes::from(out))
        } else {
            aes_decrypt(&key, data)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn crypt_with_session_key() -> ChannelCrypt {
        let private_key = Arc::new(generate_private_key().unwrap());
        let crypt = ChannelCrypt::new(private_key);
        crypt.install_session_key(generate_session_key());
        crypt
    }

    #[rstest]
    #[case::empty(0, 16)]
    #[case::md5(16, 16)]
    #[case::sha1_low(17, 20)]
    #[case::sha1_high(20, 20)]
    #[case::sha256_low(21, 32)]
    #[case::sha256_high(32, 32)]
    #[case::sha512_low(33, 64)]
    #[case::sha512_high(64, 64)]
    #[case::aes(65, 32)]
    #[case::aes_large(100_000, 32)]
    fn test_packet_key_len(#[case] data_len: usize, #[case] key_len: usize) {
        let key = packet_key(b"0123456789abcdef0123456789abcdef", PacketId::from_raw(7), data_len);
        assert_eq!(key.len(), key_len);
    }

    #[test]
    fn test_packet_key_depends_on_id() {
        let session = generate_session_key();
        let a = packet_key(&session, PacketId::from_raw(1), 100);
        let b = packet_key(&session, PacketId::from_raw(2), 100);
        assert_ne!(a, b);
    }

    #[test]
    fn test_xor_round_trip() {
        let key = [1u8, 2, 3];
        let mut data = b"some test data".to_vec();
        let original = data.clone();

        xor_in_place(&mut data, &key);
        assert_ne!(data, original);
        xor_in_place(&mut data, &key);
        assert_eq!(data, original);
    }

    #[rstest]
    #[case::empty(0)]
    #[case::xor_path(14)]
    #[case::xor_max(64)]
    #[case::aes_path(65)]
    #[case::aes_large(5000)]
    fn test_packet_data_round_trip(#[case] len: usize) {
        let crypt = crypt_with_session_key();
        let data = (0..len).map(|i| i as u8).collect::<Vec<_>>();

        let encrypted = crypt.encrypt_packet_data(PacketId::from_raw(48), &data);
        if len > 0 {
            assert_ne!(encrypted.as_ref(), data.as_slice());
        }

        let decrypted = crypt.decrypt_packet_data(PacketId::from_raw(48), &encrypted).unwrap();
        assert_eq!(decrypted.as_ref(), data.as_slice());
    }

    #[test]
    fn test_no_session_key_passes_through() {
        let crypt = ChannelCrypt::new(Arc::new(generate_private_key().unwrap()));
        assert!(!crypt.is_on());

        let encrypted = crypt.encrypt_packet_data(PacketId::ZERO, b"plain");
        assert_eq!(encrypted.as_ref(), b"plain");
    }

    #[test]
    fn test_aes_tamper_detected() {
        let crypt = crypt_with_session_key();
        let data = vec![7u8; 200];

        let encrypted = crypt.encrypt_packet_data(PacketId::from_raw(3), &data);
        let mut tampered = encrypted.to_vec();
        tampered[AES_NONCE_LEN + 5] ^= 0xFF;

        assert!(crypt.decrypt_packet_data(PacketId::from_raw(3), &tampered).is_err());
    }

    #[test]
    fn test_wrong_packet_id_fails_aead() {
        let crypt = crypt_with_session_key();
        let data = vec![7u8; 200];

        let encrypted = crypt.encrypt_packet_data(PacketId::from_raw(3), &data);
        assert!(crypt.decrypt_packet_data(PacketId::from_raw(4), &encrypted).is_err());
    }

    #[rstest]
    #[case::short(10)]
    #[case::one_chunk(62)]
    #[case::two_chunks(63)]
    #[case::many_chunks(300)]
    fn test_rsa_round_trip(#[case] len: usize) {
        let private_key = generate_private_key().unwrap();
        let public_key = private_key.to_public_key();
        let data = (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>();

        let encrypted = rsa_encrypt(&public_key, &data).unwrap();
        assert_eq!(encrypted.len(), len.div_ceil(RSA_ENCRYPT_CHUNK).max(1) * RSA_DECRYPT_CHUNK);

        let decrypted = rsa_decrypt(&private_key, &encrypted).unwrap();
        assert_eq!(decrypted.as_ref(), data.as_slice());
    }

    #[test]
    fn test_public_key_pem_round_trip() {
        let private_key = generate_private_key().unwrap();
        let public_key = private_key.to_public_key();

        let pem = public_key_to_pem(&public_key).unwrap();
        let text = std::str::from_utf8(&pem).unwrap();
        assert!(text.starts_with("-----BEGIN RSA PUBLIC KEY-----"));

        let parsed = public_key_from_pem(&pem).unwrap();
        assert_eq!(parsed, public_key);
    }

    #[test]
    fn test_public_key_from_garbage_fails() {
        assert!(public_key_from_pem(b"not a key").is_err());
    }
}
