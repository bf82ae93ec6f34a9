//! Session key derivation
//!
//! The construction is the SSLv3 handshake key schedule with protocol-
//! specific differences: salt families 'A'/'X' instead of the SSLv3 labels,
//! a 16-byte-per-slot key block partition (MAC secret, decrypt key, encrypt
//! key), and an MD5 export step for the two cipher keys. Both SHA-1 and MD5
//! are used in every round.

use tracing::debug;

use crate::crypto::{md5_digest, sha1_digest};

/// Size of the client and server randoms
pub const RANDOM_SIZE: usize = 32;

/// Fixed 40-bit export pattern written over the head of weak-mode keys
const EXPORT_PATTERN: [u8; 3] = [0xd1, 0x26, 0x9e];

/// 48-byte transform behind both the master secret and the key block
///
/// Round `i` (0..3) hashes a salt byte repeated `i + 1` times, the 48-byte
/// input and both randoms through SHA-1, then feeds the input plus that
/// digest through MD5 to fill the round's 16-byte slice of the output.
pub fn hash_48(input: &[u8; 48], salt1: &[u8; RANDOM_SIZE], salt2: &[u8; RANDOM_SIZE], salt: u8) -> [u8; 48] {
    let mut out = [0u8; 48];
    for i in 0..3 {
        let pad = [salt + i as u8; 3];
        let sha = sha1_digest(&[&pad[..=i], input, salt1, salt2]);
        let round = md5_digest(&[input, &sha]);
        out[i * 16..(i + 1) * 16].copy_from_slice(&round);
    }
    out
}

/// 16-byte transform used to generate the export cipher keys
pub fn hash_16(input: &[u8], salt1: &[u8; RANDOM_SIZE], salt2: &[u8; RANDOM_SIZE]) -> [u8; 16] {
    md5_digest(&[input, salt1, salt2])
}

/// Derive the 48-byte master secret from the two session randoms
///
/// The pre-master secret is the first 24 bytes of each random; the salt
/// family is 'A' ('A', 'BB', 'CCC').
pub fn derive_master_secret(
    client_random: &[u8; RANDOM_SIZE],
    server_random: &[u8; RANDOM_SIZE],
) -> [u8; 48] {
    let mut pre_master = [0u8; 48];
    pre_master[..24].copy_from_slice(&client_random[..24]);
    pre_master[24..].copy_from_slice(&server_random[..24]);
    hash_48(&pre_master, client_random, server_random, b'A')
}

/// Derive the 48-byte key block from the master secret
///
/// Same transform as the master secret step with salt family 'X'
/// ('X', 'YY', 'ZZZ').
pub fn derive_key_block(
    master_secret: &[u8; 48],
    client_random: &[u8; RANDOM_SIZE],
    server_random: &[u8; RANDOM_SIZE],
) -> [u8; 48] {
    hash_48(master_secret, client_random, server_random, b'X')
}

/// Session key material, derived once per session from the random pair
///
/// The decrypt/encrypt keys are replaced in place by the scheduled rekey
/// transform; the update keys stay fixed for the session lifetime.
pub struct KeyMaterial {
    /// MAC secret (first `key_len` bytes are the signing key)
    pub mac_secret: [u8; 16],
    /// Current receive-direction cipher key
    pub decrypt_key: [u8; 16],
    /// Current send-direction cipher key
    pub encrypt_key: [u8; 16],
    /// Fixed rekey input for the receive direction
    pub decrypt_update_key: [u8; 16],
    /// Fixed rekey input for the send direction
    pub encrypt_update_key: [u8; 16],
    /// Effective key length: 8 (40-bit export) or 16 (128-bit)
    pub key_len: usize,
}

impl KeyMaterial {
    /// Derive the full key set from the session randoms
    ///
    /// `rc4_key_size` is the server's negotiated method: 1 selects the
    /// 40-bit export mode, anything else the 128-bit mode.
    pub fn derive(
        client_random: &[u8; RANDOM_SIZE],
        server_random: &[u8; RANDOM_SIZE],
        rc4_key_size: u32,
    ) -> Self {
        let master_secret = derive_master_secret(client_random, server_random);
        let key_block = derive_key_block(&master_secret, client_random, server_random);

        let mut mac_secret = [0u8; 16];
        mac_secret.copy_from_slice(&key_block[..16]);

        // Export step: the two cipher keys pass through the 16-byte
        // transform, the MAC secret is used as-is.
        let mut decrypt_key = hash_16(&key_block[16..32], client_random, server_random);
        let mut encrypt_key = hash_16(&key_block[32..48], client_random, server_random);

        let key_len = if rc4_key_size == 1 {
            debug!("40-bit encryption negotiated");
            make_40bit(&mut mac_secret);
            make_40bit(&mut decrypt_key);
            make_40bit(&mut encrypt_key);
            8
        } else {
            debug!(rc4_key_size, "128-bit encryption negotiated");
            16
        };

        Self {
            mac_secret,
            decrypt_key,
            encrypt_key,
            decrypt_update_key: decrypt_key,
            encrypt_update_key: encrypt_key,
            key_len,
        }
    }

    /// Signing key view of the MAC secret
    pub fn mac_key(&self) -> &[u8] {
        &self.mac_secret[..self.key_len]
    }
}

/// Reduce key entropy from 64 to 40 bits
///
/// Historical export compatibility: the first three key bytes are replaced
/// with a fixed public pattern. Not a security feature.
pub(crate) fn make_40bit(key: &mut [u8; 16]) {
    key[..3].copy_from_slice(&EXPORT_PATTERN);
}
