//! ksync secret cipher.
//!
//! Key and IV are both derived from the passphrase alone (scrypt, salt made by
//! repeating the input), so any holder of the passphrase can decrypt without
//! a companion salt store. Encryption is deterministic: the same value always
//! yields the same ciphertext, which keeps spec files stable across syncs.

#![forbid(unsafe_code)]

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ksync_core::SyncError;
use serde_json::Value as Json;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
const SALT_LEN: usize = 16;
// scrypt N = 2^14, r = 8, p = 1
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

/// Secret payload fields whose values are encrypted. Metadata is never touched.
pub const PAYLOAD_FIELDS: [&str; 2] = ["data", "stringData"];

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("passphrase is empty")]
    EmptyKey,
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("ciphertext is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("ciphertext does not decrypt with this key")]
    Decrypt,
    #[error("plaintext is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("field {0} is not a string")]
    NotAString(String),
}

impl From<CipherError> for SyncError {
    fn from(e: CipherError) -> Self { SyncError::Cipher(e.to_string()) }
}

/// Salt made by repeating `input` until `SALT_LEN` bytes.
fn salt_for(input: &[u8]) -> Vec<u8> {
    input.iter().copied().cycle().take(SALT_LEN).collect()
}

fn derive(input: &[u8], len: usize) -> Result<Vec<u8>, CipherError> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, len).map_err(|e| CipherError::Kdf(e.to_string()))?;
    let mut out = vec![0u8; len];
    scrypt::scrypt(input, &salt_for(input), &params, &mut out).map_err(|e| CipherError::Kdf(e.to_string()))?;
    Ok(out)
}

/// Key material derived once from a passphrase; reuse it across a cycle.
#[derive(Clone)]
pub struct SecretCipher {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("SecretCipher(..)") }
}

impl SecretCipher {
    pub fn new(passphrase: &str) -> Result<Self, CipherError> {
        if passphrase.is_empty() { return Err(CipherError::EmptyKey); }
        let key_v = derive(passphrase.as_bytes(), KEY_LEN)?;
        let iv_v = derive(hex::encode(&key_v).as_bytes(), IV_LEN)?;
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        key.copy_from_slice(&key_v);
        iv.copy_from_slice(&iv_v);
        Ok(Self { key, iv })
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let ct = Aes256CbcEnc::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        B64.encode(ct)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let ct = B64.decode(ciphertext.trim())?;
        let pt = Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ct)
            .map_err(|_| CipherError::Decrypt)?;
        Ok(String::from_utf8(pt)?)
    }

    /// Encrypt every value under the payload fields of a Secret in place.
    pub fn encrypt_secret(&self, secret: &mut Json) -> Result<(), CipherError> {
        self.map_payload(secret, |v| Ok(self.encrypt(v)))
    }

    /// Reverse of [`SecretCipher::encrypt_secret`].
    pub fn decrypt_secret(&self, secret: &mut Json) -> Result<(), CipherError> {
        self.map_payload(secret, |v| self.decrypt(v))
    }

    fn map_payload<F>(&self, secret: &mut Json, f: F) -> Result<(), CipherError>
    where
        F: Fn(&str) -> Result<String, CipherError>,
    {
        for field in PAYLOAD_FIELDS {
            let Some(map) = secret.get_mut(field).and_then(|d| d.as_object_mut()) else { continue };
            for (k, v) in map.iter_mut() {
                let s = v.as_str().ok_or_else(|| CipherError::NotAString(format!("{}.{}", field, k)))?;
                *v = Json::String(f(s)?);
            }
        }
        Ok(())
    }
}

/// Whether a raw object is a core `v1` Secret.
pub fn is_secret(obj: &Json) -> bool {
    obj.get("kind").and_then(|k| k.as_str()) == Some("Secret") && obj.get("apiVersion").and_then(|a| a.as_str()) == Some("v1")
}

/// One-shot encryption; derives the key on every call.
pub fn encrypt(plaintext: &str, passphrase: &str) -> Result<String, CipherError> {
    Ok(SecretCipher::new(passphrase)?.encrypt(plaintext))
}

/// One-shot decryption; derives the key on every call.
pub fn decrypt(ciphertext: &str, passphrase: &str) -> Result<String, CipherError> {
    SecretCipher::new(passphrase)?.decrypt(ciphertext)
}
