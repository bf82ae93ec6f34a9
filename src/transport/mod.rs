//! External collaborator interfaces
//!
//! The secure layer sits between the protocol core above it and a
//! multi-channel transport below it; licensing negotiation and virtual
//! channel data are handled by collaborators it only hands units to. All
//! traits here are synchronous: this layer is purely reactive and imposes
//! no timeouts of its own (blocking semantics belong to the transport
//! implementation).

use bytes::{Bytes, BytesMut};
use std::io;

/// The multiplexed control channel carrying the core protocol's own traffic
pub const GLOBAL_CHANNEL: u16 = 1003;

/// Default sub-version marker for units framed the ordinary way
pub const SUB_VERSION_DEFAULT: u8 = 3;

/// Sentinel sub-version reported when a unit was consumed by a channel
/// collaborator rather than returned for protocol-message processing
pub const SUB_VERSION_CHANNEL: u8 = 0xff;

/// One inbound unit as delivered by the transport
pub struct InboundUnit {
    /// Unit payload, still carrying any secure header
    pub data: BytesMut,
    /// Protocol sub-version marker reported by the framing layer
    pub sub_version: u8,
    /// Channel the unit arrived on
    pub channel_id: u16,
}

/// Multi-channel transport underneath the secure layer
pub trait Transport {
    /// Perform the channel-level connect, exchanging the client data blob
    /// for the server's response blob
    fn connect(&mut self, server: &str, client_data: &[u8]) -> io::Result<Bytes>;

    /// Send one finished unit on the given channel
    fn send_unit(&mut self, data: &[u8], channel_id: u16) -> io::Result<()>;

    /// Receive the next unit; `None` signals end of stream
    fn recv_unit(&mut self) -> io::Result<Option<InboundUnit>>;

    /// Tear down the underlying connection
    fn disconnect(&mut self);
}

/// License negotiation collaborator
///
/// Invoked for every unit flagged as license negotiation; the secure layer
/// does not inspect any outcome, it only requests the next unit afterward.
pub trait LicensingHandler {
    /// Process one licensing unit (secure header already stripped)
    fn process(&mut self, unit: BytesMut);
}

/// Virtual channel data collaborator
///
/// Invoked for any inbound unit addressed to a channel other than
/// [`GLOBAL_CHANNEL`]; the returned buffer is passed through to the secure
/// layer's caller with the channel-consumed sentinel sub-version.
pub trait ChannelHandler {
    /// Process one channel-addressed unit
    fn process(&mut self, unit: BytesMut, channel_id: u16) -> BytesMut;
}
