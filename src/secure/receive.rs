//! Secure receive path
//!
//! One explicit state machine step per inbound unit. The outcome is either
//! a payload for the caller or a request for the next unit (licensing
//! traffic is consumed here and never surfaces). End-of-stream is signalled
//! by the transport returning no unit and is handled by the caller's loop,
//! not here.

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::errors::{SecureError, SecureResult};
use crate::secure::codec::SIGNATURE_SIZE;
use crate::secure::session::SecureSession;
use crate::secure::{SEC_ENCRYPT, SEC_LICENCE_NEG, SEC_REDIRECT_ENCRYPT};
use crate::transport::{
    ChannelHandler, InboundUnit, LicensingHandler, GLOBAL_CHANNEL, SUB_VERSION_CHANNEL,
    SUB_VERSION_DEFAULT,
};

/// One unit delivered to the caller for protocol-message processing
#[derive(Debug)]
pub struct ReceivedPdu {
    /// Payload with the secure header already stripped
    pub data: BytesMut,
    /// Sub-version marker: the transport's value, or the channel-consumed
    /// sentinel when a channel collaborator handled the unit
    pub sub_version: u8,
}

/// Outcome of processing one inbound unit
#[derive(Debug)]
pub enum Step {
    /// Payload ready for the caller
    Deliver(ReceivedPdu),
    /// Unit was consumed internally; receive the next one
    AwaitNext,
}

/// Run one state machine step over an inbound unit
///
/// Branches on the transport's sub-version marker first: non-default
/// framing carries its own encryption decision, so the flags word is never
/// read there. The default path reads a flags word whenever encryption is
/// negotiated or licensing has not finished, then dispatches on it.
pub fn process_unit<L, D>(
    session: &mut SecureSession,
    unit: InboundUnit,
    licensing: &mut L,
    channels: &mut D,
) -> SecureResult<Step>
where
    L: LicensingHandler,
    D: ChannelHandler,
{
    let InboundUnit {
        mut data,
        sub_version,
        channel_id,
    } = unit;

    if sub_version != SUB_VERSION_DEFAULT {
        // The framing layer has already classified this unit; the 0x80 bit
        // means it arrived encrypted.
        if sub_version & 0x80 != 0 {
            strip_signature(&mut data)?;
            decrypt_payload(session, &mut data)?;
        }
        return Ok(Step::Deliver(ReceivedPdu { data, sub_version }));
    }

    if session.encryption || !session.licence_issued {
        if data.len() < 4 {
            return Err(SecureError::malformed(
                "inbound unit too short for security flags",
            ));
        }
        let flags = data.get_u32_le();
        trace!(flags, "secure header");

        if flags & SEC_ENCRYPT != 0 {
            strip_signature(&mut data)?;
            decrypt_payload(session, &mut data)?;
        }

        if flags & SEC_LICENCE_NEG != 0 {
            debug!("handing unit to licensing");
            licensing.process(data);
            return Ok(Step::AwaitNext);
        }

        // Exclusive with the encrypt branch: the payload carries exactly
        // one signature and one cipher pass
        if flags & SEC_REDIRECT_ENCRYPT != 0 && flags & SEC_ENCRYPT == 0 {
            strip_signature(&mut data)?;
            decrypt_payload(session, &mut data)?;
            fix_redirect_header(&mut data);
        }
    }

    if channel_id != GLOBAL_CHANNEL {
        debug!(channel_id, "dispatching unit to channel handler");
        let data = channels.process(data, channel_id);
        return Ok(Step::Deliver(ReceivedPdu {
            data,
            sub_version: SUB_VERSION_CHANNEL,
        }));
    }

    Ok(Step::Deliver(ReceivedPdu { data, sub_version }))
}

fn strip_signature(data: &mut BytesMut) -> SecureResult<()> {
    if data.len() < SIGNATURE_SIZE {
        return Err(SecureError::malformed("inbound unit too short for signature"));
    }
    data.advance(SIGNATURE_SIZE);
    Ok(())
}

fn decrypt_payload(session: &mut SecureSession, data: &mut BytesMut) -> SecureResult<()> {
    match &mut session.codec {
        Some(codec) => {
            codec.decrypt(data);
            Ok(())
        }
        // Server-controlled input, so a missing-keys condition is a wire
        // protocol violation rather than a caller bug.
        None => Err(SecureError::malformed(
            "encrypted unit received before key exchange",
        )),
    }
}

/// Repair the header of a session-redirect payload
///
/// Redirect packets arrive with the PDU type and length fields in swapped
/// positions: `00 04 XX YY` where `XX YY` is the little-endian length and
/// `04 00` the type. Rearranged to `XX YY 04 00` so downstream parsing sees
/// the normal layout. Applied only when the telltale `00 04` prefix is
/// present.
fn fix_redirect_header(data: &mut BytesMut) {
    if data.len() >= 4 && data[0] == 0 && data[1] == 4 {
        warn!("correcting swapped redirect packet header");
        data.swap(0, 2);
        data.swap(1, 3);
        data.swap(2, 3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::crypto::Rc4Context;
    use crate::secure::codec::{sign, SecureCodec};
    use crate::secure::kdf::KeyMaterial;

    struct RecordingLicensing {
        units: Vec<Vec<u8>>,
    }

    impl LicensingHandler for RecordingLicensing {
        fn process(&mut self, unit: BytesMut) {
            self.units.push(unit.to_vec());
        }
    }

    struct TaggingChannels {
        calls: Vec<u16>,
    }

    impl ChannelHandler for TaggingChannels {
        fn process(&mut self, mut unit: BytesMut, channel_id: u16) -> BytesMut {
            self.calls.push(channel_id);
            unit.extend_from_slice(b"!");
            unit
        }
    }

    fn harness() -> (SecureSession, RecordingLicensing, TaggingChannels) {
        let session = SecureSession::new(&ClientConfig::default());
        (
            session,
            RecordingLicensing { units: Vec::new() },
            TaggingChannels { calls: Vec::new() },
        )
    }

    fn session_with_keys() -> SecureSession {
        let mut session = SecureSession::new(&ClientConfig::default());
        session.codec = Some(SecureCodec::new(KeyMaterial::derive(
            &[7u8; 32], &[9u8; 32], 2,
        )));
        session
    }

    /// Payload as the server would put it on the wire: signed with the
    /// session's receive-direction material, then encrypted.
    fn encrypt_as_server(session: &SecureSession, plaintext: &[u8]) -> Vec<u8> {
        let keys = session.codec.as_ref().unwrap().keys();
        let mut wire = plaintext.to_vec();
        let mut cipher = Rc4Context::new(&keys.decrypt_key[..keys.key_len]);
        cipher.apply(&mut wire);

        let mut unit = sign(keys.mac_key(), plaintext).to_vec();
        unit.extend_from_slice(&wire);
        unit
    }

    fn unit(data: &[u8], sub_version: u8, channel_id: u16) -> InboundUnit {
        InboundUnit {
            data: BytesMut::from(data),
            sub_version,
            channel_id,
        }
    }

    #[test]
    fn test_plain_unit_delivered_after_flags() {
        let (mut session, mut lic, mut chan) = harness();
        let mut wire = 0u32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"hello");

        let step = process_unit(&mut session, unit(&wire, 3, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap();
        match step {
            Step::Deliver(pdu) => {
                assert_eq!(&pdu.data[..], b"hello");
                assert_eq!(pdu.sub_version, 3);
            }
            Step::AwaitNext => panic!("expected delivery"),
        }
    }

    #[test]
    fn test_no_flags_once_licensed_and_unencrypted() {
        let (mut session, mut lic, mut chan) = harness();
        session.encryption = false;
        session.licence_issued = true;

        // Bytes that would misparse as a flags word must come through intact
        let wire = [0x08, 0x00, 0x00, 0x00, 0xaa];
        let step = process_unit(&mut session, unit(&wire, 3, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap();
        match step {
            Step::Deliver(pdu) => assert_eq!(&pdu.data[..], &wire),
            Step::AwaitNext => panic!("expected delivery"),
        }
    }

    #[test]
    fn test_encrypted_unit_decrypted() {
        let mut session = session_with_keys();
        let mut lic = RecordingLicensing { units: Vec::new() };
        let mut chan = TaggingChannels { calls: Vec::new() };

        let mut wire = SEC_ENCRYPT.to_le_bytes().to_vec();
        wire.extend_from_slice(&encrypt_as_server(&session, b"secret payload"));

        let step = process_unit(&mut session, unit(&wire, 3, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap();
        match step {
            Step::Deliver(pdu) => assert_eq!(&pdu.data[..], b"secret payload"),
            Step::AwaitNext => panic!("expected delivery"),
        }
    }

    #[test]
    fn test_encrypted_before_keys_is_malformed() {
        let (mut session, mut lic, mut chan) = harness();
        let mut wire = SEC_ENCRYPT.to_le_bytes().to_vec();
        wire.extend_from_slice(&[0u8; 16]);

        let err = process_unit(&mut session, unit(&wire, 3, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap_err();
        assert!(err.to_string().contains("key exchange"));
    }

    #[test]
    fn test_licensing_unit_consumed() {
        let (mut session, mut lic, mut chan) = harness();
        let mut wire = SEC_LICENCE_NEG.to_le_bytes().to_vec();
        wire.extend_from_slice(b"licence pdu");

        let step = process_unit(&mut session, unit(&wire, 3, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap();
        assert!(matches!(step, Step::AwaitNext));
        assert_eq!(lic.units, vec![b"licence pdu".to_vec()]);
    }

    #[test]
    fn test_redirect_header_swap() {
        let mut session = session_with_keys();
        let mut lic = RecordingLicensing { units: Vec::new() };
        let mut chan = TaggingChannels { calls: Vec::new() };

        let mut wire = SEC_REDIRECT_ENCRYPT.to_le_bytes().to_vec();
        wire.extend_from_slice(&encrypt_as_server(&session, &[0x00, 0x04, 0x2a, 0x01, 0x55]));

        let step = process_unit(&mut session, unit(&wire, 3, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap();
        match step {
            Step::Deliver(pdu) => {
                assert_eq!(&pdu.data[..], &[0x2a, 0x01, 0x04, 0x00, 0x55]);
            }
            Step::AwaitNext => panic!("expected delivery"),
        }
    }

    #[test]
    fn test_combined_encrypt_and_redirect_decrypts_once() {
        let mut session = session_with_keys();
        let mut lic = RecordingLicensing { units: Vec::new() };
        let mut chan = TaggingChannels { calls: Vec::new() };

        let mut wire = (SEC_ENCRYPT | SEC_REDIRECT_ENCRYPT).to_le_bytes().to_vec();
        wire.extend_from_slice(&encrypt_as_server(&session, b"redirect body"));

        let step = process_unit(&mut session, unit(&wire, 3, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap();
        match step {
            Step::Deliver(pdu) => assert_eq!(&pdu.data[..], b"redirect body"),
            Step::AwaitNext => panic!("expected delivery"),
        }
    }

    #[test]
    fn test_redirect_without_magic_left_alone() {
        let mut data = BytesMut::from(&[0x11, 0x22, 0x33, 0x44][..]);
        fix_redirect_header(&mut data);
        assert_eq!(&data[..], &[0x11, 0x22, 0x33, 0x44]);
    }

    #[test]
    fn test_channel_unit_dispatched_with_sentinel() {
        let (mut session, mut lic, mut chan) = harness();
        session.encryption = false;
        session.licence_issued = true;

        let step = process_unit(&mut session, unit(b"chan data", 3, 1005), &mut lic, &mut chan)
            .unwrap();
        match step {
            Step::Deliver(pdu) => {
                assert_eq!(pdu.sub_version, SUB_VERSION_CHANNEL);
                assert_eq!(&pdu.data[..], b"chan data!");
            }
            Step::AwaitNext => panic!("expected delivery"),
        }
        assert_eq!(chan.calls, vec![1005]);
    }

    #[test]
    fn test_fast_path_skips_flags_and_channel_dispatch() {
        let mut session = session_with_keys();
        let mut lic = RecordingLicensing { units: Vec::new() };
        let mut chan = TaggingChannels { calls: Vec::new() };

        let wire = encrypt_as_server(&session, b"fast path");
        let step = process_unit(&mut session, unit(&wire, 0x84, 1007), &mut lic, &mut chan)
            .unwrap();
        match step {
            Step::Deliver(pdu) => {
                assert_eq!(&pdu.data[..], b"fast path");
                assert_eq!(pdu.sub_version, 0x84);
            }
            Step::AwaitNext => panic!("expected delivery"),
        }
        assert!(chan.calls.is_empty());
    }

    #[test]
    fn test_fast_path_plain_unit_untouched() {
        let (mut session, mut lic, mut chan) = harness();
        let step = process_unit(&mut session, unit(b"\x01\x02\x03", 4, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap();
        match step {
            Step::Deliver(pdu) => assert_eq!(&pdu.data[..], &[1, 2, 3]),
            Step::AwaitNext => panic!("expected delivery"),
        }
    }

    #[test]
    fn test_truncated_flags_word_rejected() {
        let (mut session, mut lic, mut chan) = harness();
        let err = process_unit(&mut session, unit(&[0x08, 0x00], 3, GLOBAL_CHANNEL), &mut lic, &mut chan)
            .unwrap_err();
        assert!(err.to_string().contains("security flags"));
    }
}
