//! Group encryption capability.
//!
//! Private groups share a 256-bit symmetric key distributed out of band.
//! A bundle addressed to a private group opens with a Cipher block that
//! carries the suite selectors and a fresh bundle IV; every following
//! encrypted block is sealed as one bounded window with a per-block IV
//! derived from the bundle IV and the block's position in the bundle:
//!
//!   block_iv(n) = BLAKE3(bundle_iv || n as u32 BE)[..iv_size]
//!
//! All key material derives ZeroizeOnDrop.

use std::collections::HashMap;
use std::sync::RwLock;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::ids::GroupId;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Size of a group key in bytes.
pub const GROUP_KEY_SIZE: usize = 32;

/// Largest IV a Cipher block may carry.
pub const MAX_IV_SIZE: usize = 32;

// ── Selectors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Algorithm {
    Aes256 = 0x01,
    ChaCha20Poly1305 = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockMode {
    Cbc = 0x01,
    Aead = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Padding {
    None = 0x00,
    Pkcs7 = 0x01,
}

impl TryFrom<u8> for Algorithm {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Algorithm::Aes256),
            0x02 => Ok(Algorithm::ChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedSuite(format!("algorithm 0x{other:02x}"))),
        }
    }
}

impl TryFrom<u8> for BlockMode {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(BlockMode::Cbc),
            0x02 => Ok(BlockMode::Aead),
            other => Err(CryptoError::UnsupportedSuite(format!("block mode 0x{other:02x}"))),
        }
    }
}

impl TryFrom<u8> for Padding {
    type Error = CryptoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Padding::None),
            0x01 => Ok(Padding::Pkcs7),
            other => Err(CryptoError::UnsupportedSuite(format!("padding 0x{other:02x}"))),
        }
    }
}

/// A supported (algorithm, block mode, padding) combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherSuite {
    /// AES-256 in CBC mode with PKCS#7 padding.
    #[default]
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    /// ChaCha20-Poly1305 AEAD.
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub fn selectors(&self) -> (Algorithm, BlockMode, Padding) {
        match self {
            CipherSuite::Aes256Cbc => (Algorithm::Aes256, BlockMode::Cbc, Padding::Pkcs7),
            CipherSuite::ChaCha20Poly1305 => {
                (Algorithm::ChaCha20Poly1305, BlockMode::Aead, Padding::None)
            }
        }
    }

    pub fn from_selectors(
        algorithm: Algorithm,
        mode: BlockMode,
        padding: Padding,
    ) -> Result<Self, CryptoError> {
        match (algorithm, mode, padding) {
            (Algorithm::Aes256, BlockMode::Cbc, Padding::Pkcs7) => Ok(CipherSuite::Aes256Cbc),
            (Algorithm::ChaCha20Poly1305, BlockMode::Aead, Padding::None) => {
                Ok(CipherSuite::ChaCha20Poly1305)
            }
            other => Err(CryptoError::UnsupportedSuite(format!("{other:?}"))),
        }
    }

    /// IV (or nonce) size the suite consumes per block.
    pub fn iv_size(&self) -> usize {
        match self {
            CipherSuite::Aes256Cbc => 16,
            CipherSuite::ChaCha20Poly1305 => 12,
        }
    }

    /// Ciphertext length for a plaintext of `len` bytes.
    pub fn sealed_len(&self, len: usize) -> usize {
        match self {
            CipherSuite::Aes256Cbc => (len / 16 + 1) * 16,
            CipherSuite::ChaCha20Poly1305 => len + 16,
        }
    }
}

// ── Keys ──────────────────────────────────────────────────────────────────────

/// Symmetric key shared by the members of a private group.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct GroupKey([u8; GROUP_KEY_SIZE]);

impl GroupKey {
    pub fn from_bytes(bytes: [u8; GROUP_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; GROUP_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; GROUP_KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("GroupKey(..)")
    }
}

/// Looks up the key of a private group.
pub trait GroupKeyring: Send + Sync {
    fn group_key(&self, group: &GroupId) -> Option<GroupKey>;
}

/// Keyring held in memory.
#[derive(Default)]
pub struct MemoryKeyring {
    keys: RwLock<HashMap<GroupId, GroupKey>>,
}

impl MemoryKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group: GroupId, key: GroupKey) {
        if let Ok(mut keys) = self.keys.write() {
            keys.insert(group, key);
        }
    }

    pub fn remove(&self, group: &GroupId) {
        if let Ok(mut keys) = self.keys.write() {
            keys.remove(group);
        }
    }
}

impl GroupKeyring for MemoryKeyring {
    fn group_key(&self, group: &GroupId) -> Option<GroupKey> {
        self.keys.read().ok()?.get(group).cloned()
    }
}

// ── Window transform ──────────────────────────────────────────────────────────

/// Generate `size` cryptographically random bytes for a bundle IV.
pub fn generate_iv(size: usize) -> Vec<u8> {
    let mut iv = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Derive the IV of block `index` within a bundle.
pub fn block_iv(bundle_iv: &[u8], index: u32, size: usize) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(bundle_iv);
    hasher.update(&index.to_be_bytes());
    let digest = hasher.finalize();
    digest.as_bytes()[..size.min(32)].to_vec()
}

/// Per-bundle cipher state: suite, key and IV established by a Cipher block.
pub struct BundleCipher {
    suite: CipherSuite,
    key: GroupKey,
    iv: Vec<u8>,
    next_index: u32,
}

impl BundleCipher {
    pub fn new(suite: CipherSuite, key: GroupKey, iv: Vec<u8>) -> Result<Self, CryptoError> {
        if iv.is_empty() || iv.len() > MAX_IV_SIZE {
            return Err(CryptoError::BadIv(iv.len()));
        }
        Ok(Self {
            suite,
            key,
            iv,
            next_index: 0,
        })
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Encrypt the next block window of the bundle.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = block_iv(&self.iv, self.next_index, self.suite.iv_size());
        self.next_index += 1;
        seal_window(self.suite, &self.key, &iv, plaintext)
    }

    /// Decrypt the next block window of the bundle.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = block_iv(&self.iv, self.next_index, self.suite.iv_size());
        self.next_index += 1;
        open_window(self.suite, &self.key, &iv, ciphertext)
    }
}

pub fn seal_window(
    suite: CipherSuite,
    key: &GroupKey,
    iv: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match suite {
        CipherSuite::Aes256Cbc => {
            let enc = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
                .map_err(|_| CryptoError::BadIv(iv.len()))?;
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
        }
        CipherSuite::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|_| CryptoError::KeySetup)?;
            if iv.len() != 12 {
                return Err(CryptoError::BadIv(iv.len()));
            }
            cipher
                .encrypt(Nonce::from_slice(iv), plaintext)
                .map_err(|_| CryptoError::Seal)
        }
    }
}

pub fn open_window(
    suite: CipherSuite,
    key: &GroupKey,
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    match suite {
        CipherSuite::Aes256Cbc => {
            let dec = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
                .map_err(|_| CryptoError::BadIv(iv.len()))?;
            dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::Open)
        }
        CipherSuite::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
                .map_err(|_| CryptoError::KeySetup)?;
            if iv.len() != 12 {
                return Err(CryptoError::BadIv(iv.len()));
            }
            cipher
                .decrypt(Nonce::from_slice(iv), ciphertext)
                .map_err(|_| CryptoError::Open)
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("unsupported cipher suite: {0}")]
    UnsupportedSuite(String),

    #[error("no key known for group {0}")]
    UnknownGroup(String),

    #[error("invalid IV length {0}")]
    BadIv(usize),

    #[error("key setup failed")]
    KeySetup,

    #[error("encryption failed")]
    Seal,

    #[error("decryption failed (wrong key or corrupted window)")]
    Open,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
