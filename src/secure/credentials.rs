//! Server credential parsing
//!
//! The server's crypt info ships its key material in one of two encodings,
//! selected by a flag word: a raw RSA modulus/exponent structure
//! ("RDP4-style") or an X.509 certificate chain ("RDP5-style"). Both funnel
//! into a single normalized [`ServerCredential`] holding the modulus in
//! wire (little-endian) byte order.

use tracing::{debug, warn};

use crate::crypto;
use crate::errors::{SecureError, SecureResult};
use crate::secure::kdf::RANDOM_SIZE;
use crate::wire::Reader;

/// Smallest acceptable server modulus, in bytes
pub const MODULUS_MIN: usize = 64;
/// Largest acceptable server modulus, in bytes
pub const MODULUS_MAX: usize = 512;
/// Wire width of the public exponent
pub const EXPONENT_SIZE: usize = 4;

/// Zero padding trailing the modulus (and the encrypted client random)
pub(crate) const KEY_PADDING_SIZE: usize = 8;

/// "RSA1" magic heading the raw public key structure
const RSA_MAGIC: u32 = 0x3141_5352;

/// Crypt-info flag selecting the raw-key encoding
const FLAG_DIRECT_KEY: u32 = 0x0000_0001;

/// Sub-block tags inside the direct-mode RSA info region
const TAG_PUBLIC_KEY: u16 = 0x0006;
const TAG_KEY_SIGNATURE: u16 = 0x0008;

/// The only declared signature-block length that is actually verified
const VERIFIED_SIG_LEN: u16 = 72;

/// Normalized server public key, consumed once to encrypt the client random
pub struct ServerCredential {
    /// RSA modulus, little-endian, length within [`MODULUS_MIN`, `MODULUS_MAX`]
    pub modulus: Vec<u8>,
    /// RSA public exponent, little-endian
    pub exponent: [u8; EXPONENT_SIZE],
}

impl ServerCredential {
    /// Modulus length in bytes; also the width of the encrypted random
    pub fn modulus_len(&self) -> usize {
        self.modulus.len()
    }
}

/// Which encoding the server chose for its credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCredentialSource {
    /// Raw modulus/exponent structure, no certificate
    Direct,
    /// X.509 CA + leaf chain; the key comes from the verified leaf
    Chain,
}

/// Parsed server crypt info: negotiated strength, server random, credential
pub struct ServerCryptInfo {
    /// Negotiated cipher strength selector (1 = 40-bit, 2 = 128-bit)
    pub rc4_key_size: u32,
    /// Server-generated session random
    pub server_random: [u8; RANDOM_SIZE],
    /// Normalized server public key
    pub credential: ServerCredential,
    /// Encoding the credential was delivered in
    pub source: ServerCredentialSource,
}

impl ServerCryptInfo {
    /// Parse the crypt info block from the server's connect response
    ///
    /// Returns `Ok(None)` when the server negotiated encryption off
    /// (crypt level 0); any structural problem is a connection-fatal error.
    pub fn parse(data: &[u8]) -> SecureResult<Option<Self>> {
        let mut r = Reader::new(data);

        let rc4_key_size = r.u32_le("rc4 key size")?;
        let crypt_level = r.u32_le("crypt level")?;
        if crypt_level == 0 {
            debug!("server negotiated encryption off");
            return Ok(None);
        }

        let random_len = r.u32_le("server random length")? as usize;
        let rsa_info_len = r.u32_le("RSA info length")? as usize;

        if random_len != RANDOM_SIZE {
            return Err(SecureError::malformed(format!(
                "server random length {} (expected {})",
                random_len, RANDOM_SIZE
            )));
        }
        let mut server_random = [0u8; RANDOM_SIZE];
        server_random.copy_from_slice(r.take(RANDOM_SIZE, "server random")?);

        let rsa_info_end = r.position() + rsa_info_len;
        if rsa_info_end > data.len() {
            return Err(SecureError::malformed(
                "RSA info region extends past the crypt info block",
            ));
        }

        let flags = r.u32_le("RSA info flags")?;
        let (credential, source) = if flags & FLAG_DIRECT_KEY != 0 {
            debug!("server key exchange: raw RSA key");
            (
                parse_direct(&mut r, rsa_info_end)?,
                ServerCredentialSource::Direct,
            )
        } else {
            debug!("server key exchange: X.509 certificate chain");
            (parse_chain(&mut r)?, ServerCredentialSource::Chain)
        };

        Ok(Some(Self {
            rc4_key_size,
            server_random,
            credential,
            source,
        }))
    }
}

/// Parse the RDP4-style RSA info region: tagged sub-blocks holding the raw
/// public key and optionally a signature over it
fn parse_direct(r: &mut Reader<'_>, end: usize) -> SecureResult<ServerCredential> {
    r.skip(8, "RSA info header")?;

    let mut credential: Option<ServerCredential> = None;
    while r.position() < end {
        let tag = r.u16_le("RSA info tag")?;
        let length = r.u16_le("RSA info tag length")? as usize;
        let next = r.position() + length;
        if next > end {
            return Err(SecureError::malformed(format!(
                "RSA info tag 0x{tag:04x} overruns its region"
            )));
        }

        match tag {
            TAG_PUBLIC_KEY => {
                credential = Some(parse_public_key(r)?);
            }
            TAG_KEY_SIGNATURE => {
                let credential = credential.as_ref().ok_or_else(|| {
                    SecureError::malformed("key signature before public key")
                })?;
                verify_public_sig(r, length, credential)?;
            }
            _ => {
                warn!(tag = %format!("0x{tag:04x}"), "unimplemented crypt tag, skipping");
            }
        }

        r.seek(next, "RSA info tag")?;
    }

    let credential =
        credential.ok_or_else(|| SecureError::malformed("RSA info carried no public key"))?;
    r.expect_consumed_to(end, "RSA info region")?;
    Ok(credential)
}

/// Parse the raw public key structure (magic, length, exponent, modulus)
fn parse_public_key(r: &mut Reader<'_>) -> SecureResult<ServerCredential> {
    let magic = r.u32_le("RSA magic")?;
    if magic != RSA_MAGIC {
        return Err(SecureError::malformed(format!("RSA magic 0x{magic:x}")));
    }

    let declared = r.u32_le("modulus length")? as usize;
    let modulus_len = declared.wrapping_sub(KEY_PADDING_SIZE);
    if !(MODULUS_MIN..=MODULUS_MAX).contains(&modulus_len) {
        return Err(SecureError::malformed(format!(
            "bad server public key size ({} bits)",
            modulus_len.wrapping_mul(8)
        )));
    }

    r.skip(8, "modulus bits")?;
    let mut exponent = [0u8; EXPONENT_SIZE];
    exponent.copy_from_slice(r.take(EXPONENT_SIZE, "public exponent")?);
    let modulus = r.take(modulus_len, "modulus")?.to_vec();
    r.skip(KEY_PADDING_SIZE, "modulus padding")?;

    Ok(ServerCredential { modulus, exponent })
}

/// Check a declared key-signature sub-block
///
/// Only blocks declaring the one expected length are verified; any other
/// length is accepted without verification. Long-standing wire behavior,
/// do not tighten without a compatibility decision.
fn verify_public_sig(
    r: &mut Reader<'_>,
    declared_len: usize,
    credential: &ServerCredential,
) -> SecureResult<()> {
    if declared_len != VERIFIED_SIG_LEN as usize {
        warn!(declared_len, "unverifiable key signature block, accepting");
        return Ok(());
    }

    let sig_len = declared_len - KEY_PADDING_SIZE;
    let signature = r.take(sig_len, "key signature")?;
    if !crypto::verify_key_signature(&credential.modulus, &credential.exponent, signature) {
        return Err(SecureError::Trust("key signature verification failed".into()));
    }
    debug!("key signature verified");
    Ok(())
}

/// Parse the RDP5-style certificate chain and extract the leaf's RSA key
///
/// Only the last two certificates matter: everything before them is parsed
/// and dropped, tolerating individual parse failures. Trailing bytes after
/// the chain are explicitly tolerated.
fn parse_chain(r: &mut Reader<'_>) -> SecureResult<ServerCredential> {
    let cert_count = r.u32_le("certificate count")?;
    if cert_count < 2 {
        return Err(SecureError::Certificate(format!(
            "server sent {cert_count} X.509 certificates, need at least 2"
        )));
    }

    for remaining in (3..=cert_count).rev() {
        let len = r.u32_le("ignored certificate length")? as usize;
        let der = r.take(len, "ignored certificate")?;
        match crypto::parse_certificate(der) {
            Ok(_) => debug!(remaining, "skipping intermediate certificate"),
            // Tolerated: these certificates are not part of the trust decision
            Err(e) => warn!(remaining, error = %e, "unparsable intermediate certificate"),
        }
    }

    let ca_len = r.u32_le("CA certificate length")? as usize;
    let ca_der = r.take(ca_len, "CA certificate")?;
    let ca_cert = crypto::parse_certificate(ca_der)
        .map_err(|e| SecureError::Certificate(format!("CA certificate: {e}")))?;

    let leaf_len = r.u32_le("server certificate length")? as usize;
    let leaf_der = r.take(leaf_len, "server certificate")?;
    let mut leaf_cert = crypto::parse_certificate(leaf_der)
        .map_err(|e| SecureError::Certificate(format!("server certificate: {e}")))?;

    if !crypto::certificate_chain_ok(&leaf_cert, &ca_cert) {
        return Err(SecureError::Trust(
            "server certificate not signed by presented CA".into(),
        ));
    }

    // 16 reserved bytes precede the end of the chain; anything after them
    // is garbage the protocol tolerates
    let _ = r.skip(16, "chain padding");

    let (modulus_be, exponent_be) = crypto::extract_rsa_key(&mut leaf_cert)?;
    if !(MODULUS_MIN..=MODULUS_MAX).contains(&modulus_be.len()) {
        return Err(SecureError::malformed(format!(
            "bad server public key size ({} bits)",
            modulus_be.len() * 8
        )));
    }
    if exponent_be.len() > EXPONENT_SIZE {
        return Err(SecureError::Certificate(format!(
            "server public exponent too large ({} bytes)",
            exponent_be.len()
        )));
    }

    // Normalize to wire byte order (little-endian)
    let mut modulus = modulus_be;
    modulus.reverse();
    let mut exponent = [0u8; EXPONENT_SIZE];
    for (i, b) in exponent_be.iter().rev().enumerate() {
        exponent[i] = *b;
    }

    Ok(ServerCredential { modulus, exponent })
}
