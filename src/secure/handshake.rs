//! Connect-time handshake payloads
//!
//! Builds the client data blob carried inside the channel-level connect
//! (a T.124 ConferenceCreateRequest wrapping tagged client blocks) and
//! parses the server's response blob: protocol version, crypt info and the
//! server channel list. Key establishment happens here as a side effect of
//! the crypt-info block.

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::crypto;
use crate::errors::SecureResult;
use crate::secure::codec::SecureCodec;
use crate::secure::credentials::{ServerCryptInfo, KEY_PADDING_SIZE};
use crate::secure::kdf::KeyMaterial;
use crate::secure::session::SecureSession;
use crate::wire::Reader;

const TAG_CLI_INFO: u16 = 0xc001;
const TAG_CLI_CRYPT: u16 = 0xc002;
const TAG_CLI_CHANNELS: u16 = 0xc003;
const TAG_CLI_CLUSTER: u16 = 0xc004;

const TAG_SRV_INFO: u16 = 0x0c01;
const TAG_SRV_CRYPT: u16 = 0x0c02;
const TAG_SRV_CHANNELS: u16 = 0x0c03;

/// Fixed size of the client information block, tag and length included
const CLIENT_INFO_SIZE: u16 = 212;

/// Client build number advertised in the information block
const CLIENT_BUILD: u32 = 2600;

/// Build the client data blob for the channel-level connect
///
/// Layout is fixed: T.124 wrapper (big-endian fields), then the client
/// information, cluster, encryption-settings and optional channel-request
/// blocks as little-endian tagged sub-blocks.
pub fn build_client_data(config: &ClientConfig) -> Bytes {
    let mut length = 158 + 76 + 12 + 4;
    if !config.channels.is_empty() {
        length += config.channels.len() * 12 + 8;
    }

    let mut buf = BytesMut::with_capacity(length + 32);

    // T.124 ConferenceCreateRequest wrapper
    buf.put_u16(5);
    buf.put_u16(0x14);
    buf.put_u8(0x7c);
    buf.put_u16(1);
    buf.put_u16((length | 0x8000) as u16);

    buf.put_u16(8);
    buf.put_u16(16);
    buf.put_u8(0);
    buf.put_u16_le(TAG_CLI_INFO);
    buf.put_u8(0);

    buf.put_u32_le(0x6163_7544); // OEM id "Duca"
    buf.put_u16(((length - 14) | 0x8000) as u16);

    // Client information
    buf.put_u16_le(TAG_CLI_INFO);
    buf.put_u16_le(CLIENT_INFO_SIZE);
    buf.put_u16_le(if config.use_rdp5 { 4 } else { 1 });
    buf.put_u16_le(8);
    buf.put_u16_le(config.width);
    buf.put_u16_le(config.height);
    buf.put_u16_le(0xca01);
    buf.put_u16_le(0xaa03);
    buf.put_u32_le(config.keyboard_layout);
    buf.put_u32_le(CLIENT_BUILD);
    put_hostname(&mut buf, &config.hostname);
    buf.put_u32_le(config.keyboard_type);
    buf.put_u32_le(config.keyboard_subtype);
    buf.put_u32_le(config.keyboard_functionkeys);
    buf.put_bytes(0, 64);
    buf.put_u16_le(0xca01);
    buf.put_u16_le(1);
    buf.put_u32_le(0);
    buf.put_u8(config.server_depth);
    buf.put_u16_le(0x0700);
    buf.put_u8(0);
    buf.put_u32_le(1);
    buf.put_bytes(0, 64);

    // Cluster information
    buf.put_u16_le(TAG_CLI_CLUSTER);
    buf.put_u16_le(12);
    buf.put_u32_le(if config.console_session { 0xb } else { 9 });
    buf.put_u32_le(0);

    // Client encryption settings
    buf.put_u16_le(TAG_CLI_CRYPT);
    buf.put_u16_le(12);
    buf.put_u32_le(if config.encryption { 0x3 } else { 0 });
    buf.put_u32_le(0);

    if !config.channels.is_empty() {
        buf.put_u16_le(TAG_CLI_CHANNELS);
        buf.put_u16_le((config.channels.len() * 12 + 8) as u16);
        buf.put_u32_le(config.channels.len() as u32);
        for channel in &config.channels {
            debug!(name = %channel.name, "requesting virtual channel");
            let mut name = [0u8; 8];
            let ascii = channel.name.as_bytes();
            name[..ascii.len().min(7)].copy_from_slice(&ascii[..ascii.len().min(7)]);
            buf.put_slice(&name);
            buf.put_u32(channel.flags);
        }
    }

    buf.freeze()
}

/// Write the client hostname as UTF-16LE, capped at 30 bytes and padded
/// with the terminator to a fixed 32-byte region
fn put_hostname(buf: &mut BytesMut, hostname: &str) {
    let mut written = 0usize;
    for unit in hostname.encode_utf16() {
        if written + 2 > 30 {
            break;
        }
        buf.put_u16_le(unit);
        written += 2;
    }
    buf.put_bytes(0, 32 - written);
}

/// Process the server's connect response blob
///
/// Iterates the tagged sub-blocks after the T.124 response header. Each
/// block's declared length covers the tag and length fields themselves;
/// a declared length of four or less ends the iteration. Unknown tags are
/// skipped, servers may send extensions the client does not understand.
pub fn process_server_response(
    session: &mut SecureSession,
    blob: &[u8],
) -> SecureResult<()> {
    let mut r = Reader::new(blob);
    r.skip(21, "connect response header")?;

    let mut len = r.u8("user data length")?;
    if len & 0x80 != 0 {
        len = r.u8("user data length")?;
    }
    let _ = len;

    while r.remaining() >= 4 {
        let tag = r.u16_le("response tag")?;
        let length = r.u16_le("response tag length")? as usize;
        if length <= 4 {
            return Ok(());
        }
        let value = r.take(length - 4, "response tag value")?;

        match tag {
            TAG_SRV_INFO => process_server_info(session, value)?,
            TAG_SRV_CRYPT => process_crypt_info(session, value)?,
            TAG_SRV_CHANNELS => {
                // Channel id mapping is currently informational only
                debug!(len = value.len(), "server channel list received");
            }
            _ => {
                warn!(tag = %format!("0x{tag:04x}"), "unimplemented response tag, skipping");
            }
        }
    }
    Ok(())
}

/// Extract the server's protocol version and downgrade session assumptions
/// when talking to the oldest supported server generation
fn process_server_info(session: &mut SecureSession, value: &[u8]) -> SecureResult<()> {
    let mut r = Reader::new(value);
    let version = r.u16_le("server protocol version")?;
    debug!(version, "server protocol version");

    session.server_rdp_version = Some(version);
    if version == 1 {
        info!("version-1 server, disabling RDP5 features and forcing 8-bit depth");
        session.use_rdp5 = false;
        session.server_depth = 8;
    }
    Ok(())
}

/// Run key establishment from the server's crypt info block
///
/// Parses the credential, generates the client random, encrypts it under
/// the server key and derives the session key material. A crypt level of
/// zero switches the session to cleartext instead.
fn process_crypt_info(session: &mut SecureSession, value: &[u8]) -> SecureResult<()> {
    let info = match ServerCryptInfo::parse(value)? {
        Some(info) => info,
        None => {
            info!("continuing without encryption");
            session.encryption = false;
            return Ok(());
        }
    };

    debug!("generating client random");
    OsRng.fill_bytes(&mut session.client_random);
    session.crypted_random = crypto::rsa_public_encrypt(
        &session.client_random,
        &info.credential.modulus,
        &info.credential.exponent,
    );

    let keys = KeyMaterial::derive(&session.client_random, &info.server_random, info.rc4_key_size);
    session.codec = Some(SecureCodec::new(keys));
    Ok(())
}

/// Build the client-random exchange payload
///
/// `[length: u32][encrypted random: modulus_len bytes][8 zero bytes]` where
/// the length field counts the random plus its padding.
pub fn client_random_payload(session: &SecureSession) -> Bytes {
    let len = session.crypted_random.len() + KEY_PADDING_SIZE;
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32_le(len as u32);
    buf.put_slice(&session.crypted_random);
    buf.put_bytes(0, KEY_PADDING_SIZE);
    buf.freeze()
}
