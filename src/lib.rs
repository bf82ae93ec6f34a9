//! # lamco-rdp-secure
//!
//! Standard RDP security layer for the client side: key derivation,
//! server credential validation, per-packet signing/encryption with
//! scheduled rekeying, and the connect-time handshake.
//!
//! # Architecture
//!
//! ```text
//! SecureChannel
//!   ├─> Handshake (client data blob ↔ server response, key establishment)
//!   │     ├─> Credential Parser (raw RSA key or X.509 chain)
//!   │     └─> Key Derivation (SSLv3-style schedule, 40/128-bit)
//!   ├─> Codec (packet MAC, RC4, rekey every 4096 packets per direction)
//!   └─> Receive Loop (header strip, decrypt, licensing/channel dispatch)
//! ```
//!
//! The transport underneath, the licensing negotiation and virtual channel
//! handling are external collaborators behind the traits in [`transport`].
//!
//! # Data Flow
//!
//! **Connect:** client blob → transport connect → server response →
//! credential check → client random exchange → keys established
//!
//! **Send:** payload → sign → encrypt → secure header → transport
//!
//! **Receive:** transport → header/flags → decrypt → licensing/channel
//! dispatch or delivery to the protocol core

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Client configuration
pub mod config;
/// Cryptographic primitive wrappers
pub mod crypto;
/// Error taxonomy
pub mod errors;
/// Secure transport layer
pub mod secure;
/// External collaborator interfaces
pub mod transport;
/// Wire format helpers
pub mod wire;

pub use config::ClientConfig;
pub use errors::{SecureError, SecureResult};
pub use secure::receive::ReceivedPdu;
pub use secure::SecureChannel;
pub use transport::{ChannelHandler, InboundUnit, LicensingHandler, Transport};
