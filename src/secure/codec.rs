//! Per-packet signing, encryption and scheduled rekeying
//!
//! The MAC is a double-hash construction, not a standard HMAC: SHA-1 over
//! the session key, a 40-byte 0x36 pad, a 32-bit length prefix and the
//! data; then MD5 over the session key, a 48-byte 0x5c pad and the SHA-1
//! digest, truncated to the 8-byte signature field. Each direction rekeys
//! itself after 4096 packets using its fixed update key.

use tracing::debug;

use crate::crypto::{md5_digest, sha1_digest, Rc4Context};
use crate::secure::kdf::{make_40bit, KeyMaterial};

/// Width of the wire signature field
pub const SIGNATURE_SIZE: usize = 8;

/// Packets per direction between scheduled key updates
const REKEY_INTERVAL: u32 = 4096;

const PAD_54: [u8; 40] = [0x36; 40];
const PAD_92: [u8; 48] = [0x5c; 48];

/// Compute the truncated packet MAC for `data` under `session_key`
pub fn sign(session_key: &[u8], data: &[u8]) -> [u8; SIGNATURE_SIZE] {
    let length = (data.len() as u32).to_le_bytes();
    let sha = sha1_digest(&[session_key, &PAD_54, &length, data]);
    let md5 = md5_digest(&[session_key, &PAD_92, &sha]);

    let mut signature = [0u8; SIGNATURE_SIZE];
    signature.copy_from_slice(&md5[..SIGNATURE_SIZE]);
    signature
}

/// Derive a replacement cipher key from the expiring key and its update key
///
/// Pure transform: SHA-1 over (update key, 0x36 pad, old key), MD5 over
/// (update key, 0x5c pad, that digest), then the result re-encrypted
/// through RC4 keyed with itself. Only the effective `key_len` bytes
/// participate as hash inputs and in the self-application; 40-bit sessions
/// get the export pattern re-applied. The caller installs the returned key.
pub fn rekey(key: &[u8; 16], update_key: &[u8; 16], key_len: usize) -> [u8; 16] {
    let sha = sha1_digest(&[&update_key[..key_len], &PAD_54, &key[..key_len]]);
    let mut new_key = md5_digest(&[&update_key[..key_len], &PAD_92, &sha]);

    let mut cipher = Rc4Context::new(&new_key[..key_len]);
    cipher.apply(&mut new_key[..key_len]);

    if key_len == 8 {
        make_40bit(&mut new_key);
    }
    new_key
}

/// Cipher state for one traffic direction
pub struct CipherState {
    cipher: Rc4Context,
    use_count: u32,
}

impl CipherState {
    fn new(key: &[u8; 16], key_len: usize) -> Self {
        Self {
            cipher: Rc4Context::new(&key[..key_len]),
            use_count: 0,
        }
    }

    /// Packets processed since the last key update
    pub fn use_count(&self) -> u32 {
        self.use_count
    }
}

/// Bidirectional secure codec owning the session keys and both RC4 states
pub struct SecureCodec {
    keys: KeyMaterial,
    encrypt: CipherState,
    decrypt: CipherState,
}

impl SecureCodec {
    /// Build the codec from freshly derived key material
    pub fn new(keys: KeyMaterial) -> Self {
        let encrypt = CipherState::new(&keys.encrypt_key, keys.key_len);
        let decrypt = CipherState::new(&keys.decrypt_key, keys.key_len);
        Self {
            keys,
            encrypt,
            decrypt,
        }
    }

    /// Sign `data` with the session MAC secret, truncated to 8 bytes
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_SIZE] {
        sign(self.keys.mac_key(), data)
    }

    /// Encrypt `data` in place, rekeying at the scheduled boundary
    pub fn encrypt(&mut self, data: &mut [u8]) {
        if self.encrypt.use_count == REKEY_INTERVAL {
            debug!("updating send-direction key");
            let new_key = rekey(
                &self.keys.encrypt_key,
                &self.keys.encrypt_update_key,
                self.keys.key_len,
            );
            self.keys.encrypt_key = new_key;
            self.encrypt.cipher = Rc4Context::new(&new_key[..self.keys.key_len]);
            self.encrypt.use_count = 0;
        }
        self.encrypt.cipher.apply(data);
        self.encrypt.use_count += 1;
    }

    /// Decrypt `data` in place, rekeying at the scheduled boundary
    pub fn decrypt(&mut self, data: &mut [u8]) {
        if self.decrypt.use_count == REKEY_INTERVAL {
            debug!("updating receive-direction key");
            let new_key = rekey(
                &self.keys.decrypt_key,
                &self.keys.decrypt_update_key,
                self.keys.key_len,
            );
            self.keys.decrypt_key = new_key;
            self.decrypt.cipher = Rc4Context::new(&new_key[..self.keys.key_len]);
            self.decrypt.use_count = 0;
        }
        self.decrypt.cipher.apply(data);
        self.decrypt.use_count += 1;
    }

    /// Zero both per-direction use counts (reconnect reset)
    pub fn reset_use_counts(&mut self) {
        self.encrypt.use_count = 0;
        self.decrypt.use_count = 0;
    }

    /// Current key material
    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    /// Use count of the send direction
    pub fn encrypt_use_count(&self) -> u32 {
        self.encrypt.use_count
    }

    /// Use count of the receive direction
    pub fn decrypt_use_count(&self) -> u32 {
        self.decrypt.use_count
    }
}
