//! Cryptographic primitives
//!
//! Thin wrappers over the primitive crates so the protocol modules read in
//! terms of the operations the security exchange is defined over: the two
//! digest functions (SHA-1 and MD5), the RC4 stream cipher at 40- or
//! 128-bit strength, the raw RSA public-key operation on little-endian
//! operands, and X.509 parse/verify/extract for certificate-chain key
//! exchange. None of these retain state between calls except the RC4
//! context, which is owned by the codec.

use md5::{Digest as _, Md5};
use num_bigint::BigUint;
use rc4::consts::{U16, U8};
use rc4::{Key, KeyInit, Rc4, StreamCipher as _};
use sha1::Sha1;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::errors::{SecureError, SecureResult};

/// SHA-1 over a sequence of input parts (20-byte digest)
pub fn sha1_digest(parts: &[&[u8]]) -> [u8; 20] {
    let mut sha1 = Sha1::new();
    for part in parts {
        sha1.update(part);
    }
    sha1.finalize().into()
}

/// MD5 over a sequence of input parts (16-byte digest)
pub fn md5_digest(parts: &[&[u8]]) -> [u8; 16] {
    let mut md5 = Md5::new();
    for part in parts {
        md5.update(part);
    }
    md5.finalize().into()
}

/// Keyed RC4 state for one traffic direction
///
/// The effective key is either 8 bytes (40-bit export mode) or 16 bytes;
/// the key schedule runs over exactly that many bytes.
pub struct Rc4Context(Rc4Inner);

enum Rc4Inner {
    Export(Rc4<U8>),
    Full(Rc4<U16>),
}

impl Rc4Context {
    /// Key a fresh RC4 state from an 8- or 16-byte key
    pub fn new(key: &[u8]) -> Self {
        debug_assert!(key.len() == 8 || key.len() == 16);
        match key.len() {
            8 => Self(Rc4Inner::Export(Rc4::new(Key::<U8>::from_slice(key)))),
            _ => Self(Rc4Inner::Full(Rc4::new(Key::<U16>::from_slice(key)))),
        }
    }

    /// XOR the keystream over `data` in place, advancing the state
    pub fn apply(&mut self, data: &mut [u8]) {
        match &mut self.0 {
            Rc4Inner::Export(rc4) => rc4.apply_keystream(data),
            Rc4Inner::Full(rc4) => rc4.apply_keystream(data),
        }
    }
}

/// Raw (unpadded) RSA public-key operation over little-endian operands
///
/// The wire carries the modulus, exponent and operand little-endian, so the
/// whole operation stays in that byte order; the result is zero-extended to
/// the modulus length.
pub fn rsa_public_encrypt(input: &[u8], modulus_le: &[u8], exponent_le: &[u8]) -> Vec<u8> {
    let n = BigUint::from_bytes_le(modulus_le);
    let e = BigUint::from_bytes_le(exponent_le);
    let m = BigUint::from_bytes_le(input);
    let c = m.modpow(&e, &n);

    let mut out = c.to_bytes_le();
    out.resize(modulus_le.len(), 0);
    out
}

/// Verify a proprietary key-signature block against the server's own
/// modulus and exponent
///
/// The signature is recovered with the raw public-key operation and its
/// leading 16 bytes compared to MD5(modulus ‖ exponent).
pub fn verify_key_signature(modulus_le: &[u8], exponent_le: &[u8], signature: &[u8]) -> bool {
    let recovered = rsa_public_encrypt(signature, modulus_le, exponent_le);
    if recovered.len() < 16 {
        return false;
    }
    let expected = md5_digest(&[modulus_le, exponent_le]);
    recovered[..16] == expected
}

/// Parse a DER-encoded X.509 certificate
pub fn parse_certificate(der: &[u8]) -> SecureResult<X509Certificate<'_>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| SecureError::Certificate(format!("X.509 parse failed: {e}")))
}

/// Check that `leaf` is signed by `ca`
pub fn certificate_chain_ok(leaf: &X509Certificate<'_>, ca: &X509Certificate<'_>) -> bool {
    leaf.verify_signature(Some(ca.public_key())).is_ok()
}

/// Extract the RSA public key from a certificate as (modulus, exponent),
/// both big-endian with leading zero bytes stripped from the modulus
pub fn extract_rsa_key(cert: &mut X509Certificate<'_>) -> SecureResult<(Vec<u8>, Vec<u8>)> {
    // Some Windows servers issue certificates carrying obsolete signature
    // OIDs (e.g. 1.3.14.3.2.15) in the public key info; force the RSA
    // encryption OID so the key parses.
    cert.tbs_certificate.subject_pki.algorithm.algorithm =
        oid_registry::OID_PKCS1_RSAENCRYPTION;

    let public_key = cert
        .tbs_certificate
        .subject_pki
        .parsed()
        .map_err(|e| SecureError::Certificate(format!("public key parse failed: {e}")))?;

    match public_key {
        x509_parser::public_key::PublicKey::RSA(key) => {
            let modulus: Vec<u8> = {
                let raw = key.modulus;
                let start = raw.iter().position(|&b| b != 0).unwrap_or(raw.len());
                raw[start..].to_vec()
            };
            Ok((modulus, key.exponent.to_vec()))
        }
        _ => Err(SecureError::Certificate(
            "server certificate key is not RSA".into(),
        )),
    }
}
