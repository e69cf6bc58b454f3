//! Peer-transport cryptography: classic finite-field Diffie-Hellman over
//! RFC 3526 group 14 and AES-256-GCM for every frame after the handshake.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// RFC 3526, 2048-bit MODP group (id 14).
const MODP14_PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74",
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437",
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05",
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB",
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718",
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

static MODP14_PRIME: Lazy<BigUint> =
    Lazy::new(|| BigUint::parse_bytes(MODP14_PRIME_HEX.as_bytes(), 16).expect("modp14 prime"));

const GENERATOR: u32 = 2;
/// Width of the prime in bytes; public keys and shared secrets are
/// serialized left-padded to this length.
const MODP_BYTES: usize = 256;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

pub struct KeyPair {
    private: BigUint,
    public: BigUint,
}

impl KeyPair {
    /// CPU-bound (one 2048-bit modpow); call from a blocking task on hot
    /// paths.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let two = BigUint::from(2u32);
        let upper = &*MODP14_PRIME - &two;
        let private = rng.gen_biguint_range(&two, &upper);
        let public = BigUint::from(GENERATOR).modpow(&private, &MODP14_PRIME);
        Self { private, public }
    }

    pub fn public_key_b64(&self) -> String {
        BASE64.encode(to_fixed_bytes(&self.public))
    }

    /// 32-byte session key: SHA-256 of the raw shared secret.
    pub fn compute_secret(&self, remote_public_b64: &str) -> Result<[u8; 32]> {
        let bytes = BASE64
            .decode(remote_public_b64)
            .map_err(|e| anyhow!("Invalid public key encoding: {e}"))?;
        let remote = BigUint::from_bytes_be(&bytes);
        let one = BigUint::from(1u32);
        if remote <= one || remote >= &*MODP14_PRIME - &one {
            bail!("Remote public key out of range");
        }
        let shared = remote.modpow(&self.private, &MODP14_PRIME);
        let digest = Sha256::digest(to_fixed_bytes(&shared));
        Ok(digest.into())
    }
}

fn to_fixed_bytes(n: &BigUint) -> Vec<u8> {
    let raw = n.to_bytes_be();
    let mut padded = vec![0u8; MODP_BYTES.saturating_sub(raw.len())];
    padded.extend_from_slice(&raw);
    padded
}

/// AES-256-GCM with a random 12-byte IV, packed `iv ‖ tag ‖ ciphertext` and
/// base64-encoded.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<String> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| anyhow!("Encryption failed"))?;
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut packed = Vec::with_capacity(IV_LEN + sealed.len());
    packed.extend_from_slice(&iv);
    packed.extend_from_slice(tag);
    packed.extend_from_slice(body);
    Ok(BASE64.encode(packed))
}

/// Inverse of [`encrypt`]. Fails closed on any tampering: a flipped bit in
/// IV, tag, or ciphertext must surface as an error, never as bad plaintext.
pub fn decrypt(key: &[u8; 32], packed_b64: &str) -> Result<Vec<u8>> {
    let packed = BASE64
        .decode(packed_b64)
        .map_err(|e| anyhow!("Invalid ciphertext encoding: {e}"))?;
    if packed.len() < IV_LEN + TAG_LEN {
        bail!("Ciphertext too short");
    }
    let (iv, rest) = packed.split_at(IV_LEN);
    let (tag, body) = rest.split_at(TAG_LEN);

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(iv), sealed.as_slice())
        .map_err(|_| anyhow!("Decryption failed: authentication tag mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_exchange_agrees_on_both_sides() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        let alice_secret = alice.compute_secret(&bob.public_key_b64()).unwrap();
        let bob_secret = bob.compute_secret(&alice.public_key_b64()).unwrap();
        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn different_pairs_derive_different_secrets() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let eve = KeyPair::generate();

        let ab = alice.compute_secret(&bob.public_key_b64()).unwrap();
        let ae = alice.compute_secret(&eve.public_key_b64()).unwrap();
        assert_ne!(ab, ae);
    }

    #[test]
    fn degenerate_public_keys_are_rejected() {
        let pair = KeyPair::generate();
        let one = BASE64.encode(BigUint::from(1u32).to_bytes_be());
        assert!(pair.compute_secret(&one).is_err());
        assert!(pair.compute_secret("not base64!!!").is_err());
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = [7u8; 32];
        let message = b"hello across the LAN";
        let packed = encrypt(&key, message).unwrap();
        let opened = decrypt(&key, &packed).unwrap();
        assert_eq!(opened, message);
    }

    #[test]
    fn each_encryption_uses_a_fresh_iv() {
        let key = [7u8; 32];
        let a = encrypt(&key, b"same message").unwrap();
        let b = encrypt(&key, b"same message").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let key = [7u8; 32];
        let packed = encrypt(&key, b"integrity matters").unwrap();

        let mut bytes = BASE64.decode(&packed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);

        assert!(decrypt(&key, &tampered).is_err());
    }

    #[test]
    fn wrong_key_fails_closed() {
        let packed = encrypt(&[1u8; 32], b"secret").unwrap();
        assert!(decrypt(&[2u8; 32], &packed).is_err());
    }

    #[test]
    fn truncated_ciphertext_is_an_error() {
        let key = [7u8; 32];
        assert!(decrypt(&key, "").is_err());
        assert!(decrypt(&key, &BASE64.encode([0u8; 10])).is_err());
    }
}
