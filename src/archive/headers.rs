//! Optional headers carried in the central directory region
//!
//! Each header is independent: a directory may be encrypted, signed, carry
//! vendor metadata, any combination of those, or none of them.

use crate::archive::format::{read_array, read_u16, read_u32, read_u8};
use crate::error::{PakError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

pub const ENCRYPTION_HEADER_SIGNATURE: [u8; 4] = *b"ENCH";
pub const ENCRYPTION_HEADER_SIZE: usize = 40;

pub const SIGNATURE_HEADER_SIGNATURE: [u8; 4] = *b"SIGH";
pub const SIGNATURE_HEADER_SIZE: usize = 104;

pub const EXTENDED_HEADER_SIGNATURE: [u8; 4] = *b"EXTH";

/// Largest JSON payload accepted in an extended header
pub const MAX_EXTENDED_HEADER_SIZE: usize = 1024 * 1024;

const CIPHER_AES_256_GCM: u8 = 1;
const SIGNATURE_ALG_ED25519: u8 = 1;

/// Key material for an encrypted central directory
#[derive(Clone)]
pub enum CdrKey {
    /// 256-bit key used as is
    Raw([u8; 32]),
    /// Passphrase stretched with PBKDF2-HMAC-SHA256
    Passphrase(String),
}

impl CdrKey {
    fn derivation(&self) -> KeyDerivation {
        match self {
            CdrKey::Raw(_) => KeyDerivation::Raw,
            CdrKey::Passphrase(_) => KeyDerivation::Pbkdf2Sha256,
        }
    }
}

impl fmt::Debug for CdrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CdrKey::Raw(_) => f.write_str("CdrKey::Raw(..)"),
            CdrKey::Passphrase(_) => f.write_str("CdrKey::Passphrase(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyDerivation {
    Raw = 0,
    Pbkdf2Sha256 = 1,
}

impl KeyDerivation {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KeyDerivation::Raw),
            1 => Ok(KeyDerivation::Pbkdf2Sha256),
            other => Err(PakError::InvalidFormat(format!(
                "Unknown key derivation: {}",
                other
            ))),
        }
    }
}

/// Encryption Header
///
/// Structure (40 bytes):
/// - Signature: "ENCH" (4 bytes)
/// - Cipher: uint8 (1 = AES-256-GCM)
/// - Key Derivation: uint8 (0 = raw key, 1 = PBKDF2-HMAC-SHA256)
/// - Reserved: 2 bytes
/// - Iterations: uint32
/// - Salt: 16 bytes
/// - Nonce: 12 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionHeader {
    pub kdf: KeyDerivation,
    pub iterations: u32,
    pub salt: [u8; 16],
    pub nonce: [u8; 12],
}

impl EncryptionHeader {
    /// Fresh header for `key`, with random salt and nonce
    pub fn for_key(key: &CdrKey, iterations: u32) -> Self {
        let kdf = key.derivation();
        Self {
            kdf,
            iterations: if kdf == KeyDerivation::Raw { 0 } else { iterations },
            salt: rand::random(),
            nonce: rand::random(),
        }
    }

    /// Draw a new nonce; must happen before every encryption
    pub fn refresh_nonce(&mut self) {
        self.nonce = rand::random();
    }

    /// Turn caller key material into the AES key this header describes
    pub fn derive_key(&self, key: &CdrKey) -> Result<[u8; 32]> {
        match (self.kdf, key) {
            (KeyDerivation::Raw, CdrKey::Raw(raw)) => Ok(*raw),
            (KeyDerivation::Pbkdf2Sha256, CdrKey::Passphrase(passphrase)) => {
                let mut derived = [0u8; 32];
                pbkdf2_hmac::<Sha256>(
                    passphrase.as_bytes(),
                    &self.salt,
                    self.iterations,
                    &mut derived,
                );
                Ok(derived)
            }
            (expected, _) => Err(PakError::InvalidArgument(format!(
                "Directory key does not match key derivation {:?}",
                expected
            ))),
        }
    }

    pub fn encrypt(&self, key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&self.nonce);
        let cipher = Aes256Gcm::new(key.into());
        cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| PakError::EncryptionFailed)
    }

    pub fn decrypt(&self, key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>> {
        #[allow(deprecated)]
        let nonce = Nonce::from_slice(&self.nonce);
        let cipher = Aes256Gcm::new(key.into());
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| PakError::DecryptionFailed)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&ENCRYPTION_HEADER_SIGNATURE)?;
        writer.write_all(&[CIPHER_AES_256_GCM, self.kdf as u8, 0, 0])?;
        writer.write_all(&self.iterations.to_le_bytes())?;
        writer.write_all(&self.salt)?;
        writer.write_all(&self.nonce)?;
        Ok(ENCRYPTION_HEADER_SIZE)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let sig: [u8; 4] = read_array(&mut reader)?;
        if sig != ENCRYPTION_HEADER_SIGNATURE {
            return Err(PakError::InvalidFormat(
                "Invalid encryption header signature (expected ENCH)".to_string(),
            ));
        }

        let cipher = read_u8(&mut reader)?;
        if cipher != CIPHER_AES_256_GCM {
            return Err(PakError::InvalidFormat(format!("Unknown cipher: {}", cipher)));
        }
        let kdf = KeyDerivation::from_u8(read_u8(&mut reader)?)?;
        let _reserved = read_u16(&mut reader)?;
        let iterations = read_u32(&mut reader)?;
        if kdf == KeyDerivation::Pbkdf2Sha256 && iterations == 0 {
            return Err(PakError::InvalidFormat(
                "PBKDF2 iteration count is zero".to_string(),
            ));
        }

        Ok(Self {
            kdf,
            iterations,
            salt: read_array(&mut reader)?,
            nonce: read_array(&mut reader)?,
        })
    }
}

/// Signature Header
///
/// Ed25519 signature over the SHA-256 digest of the directory region
/// (everything except this header).
///
/// Structure (104 bytes):
/// - Signature: "SIGH" (4 bytes)
/// - Algorithm: uint8 (1 = Ed25519)
/// - Reserved: 3 bytes
/// - Public Key: 32 bytes
/// - Signature: 64 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub public_key: [u8; 32],
    pub signature: [u8; 64],
}

impl SignatureHeader {
    pub fn sign(signing_key: &SigningKey, digest: &[u8; 32]) -> Self {
        let signature = signing_key.sign(digest);
        Self {
            public_key: signing_key.verifying_key().to_bytes(),
            signature: signature.to_bytes(),
        }
    }

    /// Check the signature against `digest`, returning the signer's key
    pub fn verify(&self, digest: &[u8; 32]) -> Result<VerifyingKey> {
        let public_key = VerifyingKey::from_bytes(&self.public_key)?;
        let signature = Signature::from_bytes(&self.signature);
        public_key.verify(digest, &signature)?;
        Ok(public_key)
    }

    /// Hex encoding of the signer's public key
    pub fn fingerprint(&self) -> String {
        hex::encode(self.public_key)
    }

    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        writer.write_all(&SIGNATURE_HEADER_SIGNATURE)?;
        writer.write_all(&[SIGNATURE_ALG_ED25519, 0, 0, 0])?;
        writer.write_all(&self.public_key)?;
        writer.write_all(&self.signature)?;
        Ok(SIGNATURE_HEADER_SIZE)
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let sig: [u8; 4] = read_array(&mut reader)?;
        if sig != SIGNATURE_HEADER_SIGNATURE {
            return Err(PakError::InvalidFormat(
                "Invalid signature header signature (expected SIGH)".to_string(),
            ));
        }

        let algorithm = read_u8(&mut reader)?;
        if algorithm != SIGNATURE_ALG_ED25519 {
            return Err(PakError::InvalidFormat(format!(
                "Unknown signature algorithm: {}",
                algorithm
            )));
        }
        let _reserved: [u8; 3] = read_array(&mut reader)?;

        Ok(Self {
            public_key: read_array(&mut reader)?,
            signature: read_array(&mut reader)?,
        })
    }
}

/// Vendor/engine metadata stored as JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedHeader {
    pub vendor: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ExtendedHeader {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Write "EXTH", the JSON length and the JSON payload
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<usize> {
        let json = serde_json::to_vec(self)?;
        if json.len() > MAX_EXTENDED_HEADER_SIZE {
            return Err(PakError::InvalidArgument(format!(
                "Extended header too large: {} bytes (max {})",
                json.len(),
                MAX_EXTENDED_HEADER_SIZE
            )));
        }

        writer.write_all(&EXTENDED_HEADER_SIGNATURE)?;
        writer.write_all(&(json.len() as u32).to_le_bytes())?;
        writer.write_all(&json)?;
        Ok(8 + json.len())
    }

    pub fn read_from<R: Read>(mut reader: R) -> Result<Self> {
        let sig: [u8; 4] = read_array(&mut reader)?;
        if sig != EXTENDED_HEADER_SIGNATURE {
            return Err(PakError::InvalidFormat(
                "Invalid extended header signature (expected EXTH)".to_string(),
            ));
        }

        let len = read_u32(&mut reader)? as usize;
        if len > MAX_EXTENDED_HEADER_SIZE {
            return Err(PakError::InvalidFormat(format!(
                "Extended header length {} exceeds maximum {}",
                len, MAX_EXTENDED_HEADER_SIZE
            )));
        }

        let mut json = vec![0u8; len];
        reader.read_exact(&mut json)?;
        Ok(serde_json::from_slice(&json)?)
    }
}
