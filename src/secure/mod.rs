//! Secure transport layer
//!
//! Standard RDP security: session key derivation from exchanged randoms,
//! server credential validation, per-packet signing and RC4 encryption with
//! scheduled rekeying, and the connect-time handshake that wires it all
//! together. [`SecureChannel`] is the entry point; it owns the transport,
//! licensing and channel collaborators plus the per-connection session
//! state.

pub mod codec;
pub mod credentials;
pub mod handshake;
pub mod kdf;
pub mod receive;
pub mod session;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::errors::{SecureError, SecureResult};
use crate::secure::receive::{ReceivedPdu, Step};
use crate::secure::session::SecureSession;
use crate::transport::{ChannelHandler, LicensingHandler, Transport, GLOBAL_CHANNEL};

/// Client random exchange packet
pub const SEC_EXCHANGE_PKT: u32 = 0x0001;
/// Payload is signed and encrypted
pub const SEC_ENCRYPT: u32 = 0x0008;
/// License negotiation traffic
pub const SEC_LICENCE_NEG: u32 = 0x0080;
/// Encrypted session-redirect packet
pub const SEC_REDIRECT_ENCRYPT: u32 = 0x0400;

/// Secure channel over a multi-channel transport
///
/// Generic over the three external collaborators so tests can script them.
/// All methods take `&mut self`; the session state is owned here and never
/// shared.
pub struct SecureChannel<T, L, D> {
    config: ClientConfig,
    transport: T,
    licensing: L,
    channels: D,
    session: SecureSession,
}

impl<T, L, D> SecureChannel<T, L, D>
where
    T: Transport,
    L: LicensingHandler,
    D: ChannelHandler,
{
    /// Build a channel from its collaborators; no I/O happens here
    pub fn new(config: ClientConfig, transport: T, licensing: L, channels: D) -> Self {
        let session = SecureSession::new(&config);
        Self {
            config,
            transport,
            licensing,
            channels,
            session,
        }
    }

    /// Establish the secure connection
    ///
    /// Exchanges the client data blob for the server response, processes
    /// the response (which derives the session keys when the server sends
    /// crypt info) and, when encryption is on, transfers the encrypted
    /// client random to the server.
    pub fn connect(&mut self, server: &str) -> SecureResult<()> {
        info!(server, "establishing secure connection");
        let client_data = handshake::build_client_data(&self.config);
        let response = self.transport.connect(server, &client_data)?;
        handshake::process_server_response(&mut self.session, &response)?;

        if self.session.encryption {
            // The response must have carried crypt info; without keys there
            // is no random to exchange
            if !self.session.keys_established() {
                return Err(SecureError::malformed(
                    "encryption requested but server response carried no crypt info",
                ));
            }
            debug!("transferring client random");
            let payload = handshake::client_random_payload(&self.session);
            self.send(&payload, SEC_EXCHANGE_PKT)?;
        }
        Ok(())
    }

    /// Send a payload on the global channel
    pub fn send(&mut self, data: &[u8], flags: u32) -> SecureResult<()> {
        self.send_to_channel(data, flags, GLOBAL_CHANNEL)
    }

    /// Send a payload on the given channel
    ///
    /// The flags word is written whenever licensing has not completed or
    /// the payload is encrypted, and it keeps the encrypt bit on the wire.
    /// Encrypted payloads are signed first, then encrypted in place.
    ///
    /// # Panics
    ///
    /// Panics if `flags` carries [`SEC_ENCRYPT`] before key establishment;
    /// callers must complete [`connect`](Self::connect) first.
    pub fn send_to_channel(&mut self, data: &[u8], flags: u32, channel_id: u16) -> SecureResult<()> {
        let mut unit = BytesMut::with_capacity(12 + data.len());
        if !self.session.licence_issued || flags & SEC_ENCRYPT != 0 {
            unit.put_u32_le(flags);
        }

        if flags & SEC_ENCRYPT != 0 {
            let codec = self
                .session
                .codec
                .as_mut()
                .expect("encrypted send before key establishment");
            unit.put_slice(&codec.sign(data));
            let mut body = data.to_vec();
            codec.encrypt(&mut body);
            unit.put_slice(&body);
        } else {
            unit.put_slice(data);
        }

        self.transport.send_unit(&unit, channel_id)?;
        Ok(())
    }

    /// Receive the next unit for protocol-message processing
    ///
    /// Licensing traffic is consumed internally; channel traffic comes back
    /// with the channel-consumed sentinel sub-version. `None` means the
    /// transport reached end of stream.
    pub fn recv(&mut self) -> SecureResult<Option<ReceivedPdu>> {
        loop {
            let unit = match self.transport.recv_unit()? {
                Some(unit) => unit,
                None => return Ok(None),
            };
            match receive::process_unit(
                &mut self.session,
                unit,
                &mut self.licensing,
                &mut self.channels,
            )? {
                Step::Deliver(pdu) => return Ok(Some(pdu)),
                Step::AwaitNext => {}
            }
        }
    }

    /// Return the session to its initial negotiation state for a reconnect
    pub fn reset(&mut self) {
        debug!("resetting secure session state");
        self.session.reset();
    }

    /// Tear down the transport connection
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    /// Read access to the session state
    pub fn session(&self) -> &SecureSession {
        &self.session
    }

    /// Mutable access to the session state, for the licensing collaborator's
    /// completion callback
    pub fn session_mut(&mut self) -> &mut SecureSession {
        &mut self.session
    }

    /// Access to the owned transport collaborator
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the owned transport collaborator
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
