//! End-to-end tests for the secure channel over a scripted transport

use std::collections::VecDeque;
use std::io;

use bytes::{Bytes, BytesMut};

use lamco_rdp_secure::crypto::Rc4Context;
use lamco_rdp_secure::secure::codec::sign;
use lamco_rdp_secure::secure::{SEC_ENCRYPT, SEC_LICENCE_NEG, SEC_REDIRECT_ENCRYPT};
use lamco_rdp_secure::transport::{GLOBAL_CHANNEL, SUB_VERSION_CHANNEL};
use lamco_rdp_secure::{
    ChannelHandler, ClientConfig, InboundUnit, LicensingHandler, SecureChannel, Transport,
};

/// Transport that replays a canned connect response and queued inbound units
struct MockTransport {
    response: Vec<u8>,
    client_data: Vec<u8>,
    sent: Vec<(Vec<u8>, u16)>,
    inbound: VecDeque<(Vec<u8>, u8, u16)>,
    connected: bool,
}

impl MockTransport {
    fn new(response: Vec<u8>) -> Self {
        Self {
            response,
            client_data: Vec::new(),
            sent: Vec::new(),
            inbound: VecDeque::new(),
            connected: false,
        }
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, _server: &str, client_data: &[u8]) -> io::Result<Bytes> {
        self.connected = true;
        self.client_data = client_data.to_vec();
        Ok(Bytes::from(self.response.clone()))
    }

    fn send_unit(&mut self, data: &[u8], channel_id: u16) -> io::Result<()> {
        self.sent.push((data.to_vec(), channel_id));
        Ok(())
    }

    fn recv_unit(&mut self) -> io::Result<Option<InboundUnit>> {
        Ok(self.inbound.pop_front().map(|(data, sub_version, channel_id)| InboundUnit {
            data: BytesMut::from(&data[..]),
            sub_version,
            channel_id,
        }))
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

#[derive(Default)]
struct RecordingLicensing {
    units: Vec<Vec<u8>>,
}

impl LicensingHandler for RecordingLicensing {
    fn process(&mut self, unit: BytesMut) {
        self.units.push(unit.to_vec());
    }
}

#[derive(Default)]
struct PassthroughChannels {
    calls: Vec<u16>,
}

impl ChannelHandler for PassthroughChannels {
    fn process(&mut self, unit: BytesMut, channel_id: u16) -> BytesMut {
        self.calls.push(channel_id);
        unit
    }
}

/// Direct-mode crypt info block with a fixed 64-byte modulus
fn crypt_info_value(rc4_key_size: u32) -> Vec<u8> {
    let mut rsa_info = Vec::new();
    rsa_info.extend_from_slice(&1u32.to_le_bytes()); // direct-key flag
    rsa_info.extend_from_slice(&[0u8; 8]);
    rsa_info.extend_from_slice(&0x0006u16.to_le_bytes());
    rsa_info.extend_from_slice(&((4 + 4 + 8 + 4 + 64 + 8) as u16).to_le_bytes());
    rsa_info.extend_from_slice(&0x3141_5352u32.to_le_bytes()); // "RSA1"
    rsa_info.extend_from_slice(&72u32.to_le_bytes());
    rsa_info.extend_from_slice(&[0u8; 8]);
    rsa_info.extend_from_slice(&[0x01, 0x00, 0x01, 0x00]); // e = 65537
    rsa_info.extend_from_slice(&[0xab; 64]);
    rsa_info.extend_from_slice(&[0u8; 8]);

    let mut value = Vec::new();
    value.extend_from_slice(&rc4_key_size.to_le_bytes());
    value.extend_from_slice(&2u32.to_le_bytes()); // crypt level
    value.extend_from_slice(&32u32.to_le_bytes());
    value.extend_from_slice(&(rsa_info.len() as u32).to_le_bytes());
    value.extend_from_slice(&[0x55; 32]); // server random
    value.extend_from_slice(&rsa_info);
    value
}

fn response_blob(blocks: &[(u16, &[u8])]) -> Vec<u8> {
    let mut blob = vec![0u8; 21];
    blob.push(0x2a);
    for (tag, value) in blocks {
        blob.extend_from_slice(&tag.to_le_bytes());
        blob.extend_from_slice(&((value.len() + 4) as u16).to_le_bytes());
        blob.extend_from_slice(value);
    }
    blob
}

fn full_response(version: u16, rc4_key_size: u32) -> Vec<u8> {
    let crypt = crypt_info_value(rc4_key_size);
    response_blob(&[(0x0c01, &version.to_le_bytes()), (0x0c02, &crypt)])
}

type TestChannel = SecureChannel<MockTransport, RecordingLicensing, PassthroughChannels>;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
}

fn connected_channel(response: Vec<u8>) -> TestChannel {
    init_logging();
    let mut config = ClientConfig::default();
    config.hostname = "testbox".into();
    let mut channel = SecureChannel::new(
        config,
        MockTransport::new(response),
        RecordingLicensing::default(),
        PassthroughChannels::default(),
    );
    channel.connect("server.example").unwrap();
    channel
}

/// Server-side encryption of a payload, tracking the session's receive keys
fn encrypt_as_server(channel: &TestChannel, plaintext: &[u8]) -> Vec<u8> {
    let keys = channel.session().codec().unwrap().keys();
    let mut wire = plaintext.to_vec();
    Rc4Context::new(&keys.decrypt_key[..keys.key_len]).apply(&mut wire);

    let mut unit = sign(keys.mac_key(), plaintext).to_vec();
    unit.extend_from_slice(&wire);
    unit
}

#[test]
fn test_connect_establishes_keys_and_sends_random() {
    let channel = connected_channel(full_response(4, 2));
    let session = channel.session();

    assert_eq!(session.server_rdp_version(), Some(4));
    assert!(session.keys_established());
    assert!(session.encryption());

    // One outbound unit: the client random exchange on the global channel
    let transport = &channel_transport(&channel).sent;
    assert_eq!(transport.len(), 1);
    let (unit, channel_id) = &transport[0];
    assert_eq!(*channel_id, GLOBAL_CHANNEL);
    // flags word, then the length field counting random plus padding
    assert_eq!(&unit[..4], &0x0001u32.to_le_bytes());
    assert_eq!(&unit[4..8], &72u32.to_le_bytes());
    assert_eq!(unit.len(), 4 + 4 + 64 + 8);
    // Padding tail is zero
    assert_eq!(&unit[unit.len() - 8..], &[0u8; 8]);
}

#[test]
fn test_version_one_server_downgrades() {
    let channel = connected_channel(full_response(1, 2));
    let session = channel.session();
    assert_eq!(session.server_rdp_version(), Some(1));
    assert!(!session.use_rdp5());
    assert_eq!(session.server_depth(), 8);
    // Encryption is unaffected by the version downgrade
    assert!(session.keys_established());
}

#[test]
fn test_cleartext_server_skips_key_exchange() {
    let mut crypt = crypt_info_value(2);
    crypt[4..8].copy_from_slice(&0u32.to_le_bytes()); // crypt level 0
    let response = response_blob(&[(0x0c01, &4u16.to_le_bytes()), (0x0c02, &crypt)]);

    let channel = connected_channel(response);
    assert!(!channel.session().encryption());
    assert!(!channel.session().keys_established());
    // No client random goes out
    assert!(channel_transport(&channel).sent.is_empty());
}

#[test]
fn test_missing_crypt_info_fails_connect() {
    init_logging();
    // Server info only, no crypt block, while the client wants encryption
    let response = response_blob(&[(0x0c01, &4u16.to_le_bytes())]);
    let mut channel = SecureChannel::new(
        ClientConfig::default(),
        MockTransport::new(response),
        RecordingLicensing::default(),
        PassthroughChannels::default(),
    );

    assert!(channel.connect("server.example").is_err());
    // No client random goes out over the broken handshake
    assert!(channel.transport().sent.is_empty());
}

#[test]
fn test_encrypted_send_layout() {
    let mut channel = connected_channel(full_response(4, 2));
    let payload = b"input event batch";
    channel.send(payload, SEC_ENCRYPT).unwrap();

    let keys = channel.session().codec().unwrap().keys();
    let encrypt_key = keys.encrypt_key;
    let key_len = keys.key_len;
    let expected_sig = sign(keys.mac_key(), payload);

    let sent = &channel_transport(&channel).sent;
    let (unit, _) = &sent[1]; // sent[0] is the client random
    // Wire keeps the encrypt bit in the flags word
    assert_eq!(&unit[..4], &SEC_ENCRYPT.to_le_bytes());

    // Signature is over the plaintext
    assert_eq!(&unit[4..12], &expected_sig);

    // Body decrypts back to the payload with the session encrypt key
    let mut body = unit[12..].to_vec();
    Rc4Context::new(&encrypt_key[..key_len]).apply(&mut body);
    assert_eq!(&body, payload);
}

#[test]
fn test_licensing_units_consumed_before_delivery() {
    let mut channel = connected_channel(full_response(4, 2));

    let mut licence_unit = SEC_LICENCE_NEG.to_le_bytes().to_vec();
    licence_unit.extend_from_slice(b"licence request");
    let mut plain_unit = 0u32.to_le_bytes().to_vec();
    plain_unit.extend_from_slice(b"demand active");

    {
        let transport = channel_transport_mut(&mut channel);
        transport.inbound.push_back((licence_unit, 3, GLOBAL_CHANNEL));
        transport.inbound.push_back((plain_unit, 3, GLOBAL_CHANNEL));
    }

    let pdu = channel.recv().unwrap().unwrap();
    assert_eq!(&pdu.data[..], b"demand active");
    assert_eq!(pdu.sub_version, 3);
}

#[test]
fn test_channel_unit_comes_back_with_sentinel() {
    let mut channel = connected_channel(full_response(4, 2));

    let mut unit = 0u32.to_le_bytes().to_vec();
    unit.extend_from_slice(b"clipboard data");
    channel_transport_mut(&mut channel)
        .inbound
        .push_back((unit, 3, 1005));

    let pdu = channel.recv().unwrap().unwrap();
    assert_eq!(pdu.sub_version, SUB_VERSION_CHANNEL);
    assert_eq!(&pdu.data[..], b"clipboard data");
}

#[test]
fn test_encrypted_receive_round_trip() {
    let mut channel = connected_channel(full_response(4, 2));

    let mut unit = SEC_ENCRYPT.to_le_bytes().to_vec();
    unit.extend_from_slice(&encrypt_as_server(&channel, b"bitmap update"));
    channel_transport_mut(&mut channel)
        .inbound
        .push_back((unit, 3, GLOBAL_CHANNEL));

    let pdu = channel.recv().unwrap().unwrap();
    assert_eq!(&pdu.data[..], b"bitmap update");
}

#[test]
fn test_redirect_packet_header_corrected() {
    let mut channel = connected_channel(full_response(4, 2));

    let mut unit = SEC_REDIRECT_ENCRYPT.to_le_bytes().to_vec();
    unit.extend_from_slice(&encrypt_as_server(&channel, &[0x00, 0x04, 0x30, 0x00, 0x99]));
    channel_transport_mut(&mut channel)
        .inbound
        .push_back((unit, 3, GLOBAL_CHANNEL));

    let pdu = channel.recv().unwrap().unwrap();
    assert_eq!(&pdu.data[..], &[0x30, 0x00, 0x04, 0x00, 0x99]);
}

#[test]
fn test_end_of_stream_returns_none() {
    let mut channel = connected_channel(full_response(4, 2));
    assert!(channel.recv().unwrap().is_none());
}

#[test]
fn test_reset_clears_negotiated_state() {
    let mut channel = connected_channel(full_response(4, 2));
    channel.reset();
    assert!(channel.session().server_rdp_version().is_none());
    // Key material survives for reconnect
    assert!(channel.session().keys_established());
}

#[test]
fn test_forty_bit_negotiation() {
    let channel = connected_channel(full_response(4, 1));
    let keys = channel.session().codec().unwrap().keys();
    assert_eq!(keys.key_len, 8);
    assert_eq!(&keys.encrypt_key[..3], &[0xd1, 0x26, 0x9e]);
}

fn channel_transport(channel: &TestChannel) -> &MockTransport {
    channel.transport()
}

fn channel_transport_mut(channel: &mut TestChannel) -> &mut MockTransport {
    channel.transport_mut()
}
