use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use ring::{aead, hmac, pbkdf2, rand::{SecureRandom, SystemRandom}};
use std::num::NonZeroU32;

const APP_SECRET: &[u8] = b"contabilidade-pro-secret-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const SIGNING_KEY_LEN: usize = 32;

pub struct CryptoService;

impl CryptoService {
    /// Encrypts a secret for storage in the settings table (`enc:<salt>:<nonce>:<data>`).
    pub fn encrypt_secret(plaintext: &str) -> Result<String> {
        let rng = SystemRandom::new();
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt)
            .map_err(|_| anyhow!("Failed to generate salt"))?;

        let key = derive_key(&salt)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|_| anyhow!("Failed to generate nonce"))?;

        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);
        let mut in_out = plaintext.as_bytes().to_vec();
        key.seal_in_place_append_tag(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| anyhow!("Encryption failed"))?;

        Ok(format!(
            "enc:{}:{}:{}",
            general_purpose::STANDARD.encode(salt),
            general_purpose::STANDARD.encode(nonce_bytes),
            general_purpose::STANDARD.encode(in_out)
        ))
    }

    pub fn decrypt_secret(ciphertext: &str) -> Result<String> {
        let parts: Vec<&str> = ciphertext.split(':').collect();
        if parts.len() != 4 || parts[0] != "enc" {
            return Err(anyhow!("Invalid encrypted payload"));
        }
        let salt = general_purpose::STANDARD
            .decode(parts[1])
            .map_err(|e| anyhow!("Decode salt: {}", e))?;
        let nonce_bytes = general_purpose::STANDARD
            .decode(parts[2])
            .map_err(|e| anyhow!("Decode nonce: {}", e))?;
        let mut data = general_purpose::STANDARD
            .decode(parts[3])
            .map_err(|e| anyhow!("Decode ciphertext: {}", e))?;

        let key = derive_key(&salt)?;
        let nonce = aead::Nonce::assume_unique_for_key(
            nonce_bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("Invalid nonce length"))?,
        );

        let decrypted = key
            .open_in_place(nonce, aead::Aad::empty(), &mut data)
            .map_err(|_| anyhow!("Decryption failed"))?;
        Ok(String::from_utf8(decrypted.to_vec())?)
    }

    /// Fresh hex-encoded key for document URL signatures.
    pub fn generate_signing_key() -> Result<String> {
        let mut key = [0u8; SIGNING_KEY_LEN];
        SystemRandom::new()
            .fill(&mut key)
            .map_err(|_| anyhow!("Failed to generate signing key"))?;
        Ok(hex::encode(key))
    }

    pub fn sign(key_hex: &str, message: &str) -> Result<String> {
        let key = signing_key(key_hex)?;
        Ok(hex::encode(hmac::sign(&key, message.as_bytes()).as_ref()))
    }

    pub fn verify(key_hex: &str, message: &str, signature_hex: &str) -> Result<bool> {
        let key = signing_key(key_hex)?;
        let Ok(signature) = hex::decode(signature_hex) else {
            return Ok(false);
        };
        Ok(hmac::verify(&key, message.as_bytes(), &signature).is_ok())
    }
}

fn signing_key(key_hex: &str) -> Result<hmac::Key> {
    let bytes = hex::decode(key_hex).map_err(|e| anyhow!("Invalid signing key: {}", e))?;
    Ok(hmac::Key::new(hmac::HMAC_SHA256, &bytes))
}

fn derive_key(salt: &[u8]) -> Result<aead::LessSafeKey> {
    let mut key_bytes = [0u8; 32];
    let iterations = NonZeroU32::new(PBKDF2_ITERATIONS).ok_or_else(|| anyhow!("Invalid iterations"))?;
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        APP_SECRET,
        &mut key_bytes,
    );
    let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
        .map_err(|_| anyhow!("Invalid key material"))?;
    Ok(aead::LessSafeKey::new(unbound))
}
