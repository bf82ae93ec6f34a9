//! Per-connection session state
//!
//! One owned object per connection, passed explicitly to every operation:
//! created at connect, reset on reconnect, dropped at disconnect. Nothing
//! here is process-wide.

use crate::config::ClientConfig;
use crate::secure::codec::SecureCodec;
use crate::secure::kdf::RANDOM_SIZE;

/// Mutable state of one secure session
pub struct SecureSession {
    /// RDP version reported by the server, once known
    pub(crate) server_rdp_version: Option<u16>,
    /// Whether license negotiation has completed
    pub(crate) licence_issued: bool,
    /// Whether encryption is in effect for this session (requested by the
    /// client and not negotiated off by the server)
    pub(crate) encryption: bool,
    /// RDP5 feature assumption, downgraded when the server reports version 1
    pub(crate) use_rdp5: bool,
    /// Colour depth assumption, forced to 8 for version-1 servers
    pub(crate) server_depth: u8,
    /// Locally generated session random
    pub(crate) client_random: [u8; RANDOM_SIZE],
    /// Client random after RSA encryption with the server credential;
    /// its length equals the server modulus length
    pub(crate) crypted_random: Vec<u8>,
    /// Packet codec, present once key establishment has run
    pub(crate) codec: Option<SecureCodec>,
}

impl SecureSession {
    /// Fresh session state for a new connection
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            server_rdp_version: None,
            licence_issued: false,
            encryption: config.encryption,
            use_rdp5: config.use_rdp5,
            server_depth: config.server_depth,
            client_random: [0u8; RANDOM_SIZE],
            crypted_random: Vec::new(),
            codec: None,
        }
    }

    /// Return to initial negotiation state for a reconnect
    ///
    /// Clears the negotiated server version and both per-direction use
    /// counts; derived key material is kept so a session-directory
    /// reconnect can resume.
    pub fn reset(&mut self) {
        self.server_rdp_version = None;
        if let Some(codec) = &mut self.codec {
            codec.reset_use_counts();
        }
    }

    /// RDP version reported by the server, if the handshake got that far
    pub fn server_rdp_version(&self) -> Option<u16> {
        self.server_rdp_version
    }

    /// Whether RDP5 features remain enabled
    pub fn use_rdp5(&self) -> bool {
        self.use_rdp5
    }

    /// Effective colour depth assumption
    pub fn server_depth(&self) -> u8 {
        self.server_depth
    }

    /// Whether encryption is in effect for this session
    pub fn encryption(&self) -> bool {
        self.encryption
    }

    /// Whether key material has been established
    pub fn keys_established(&self) -> bool {
        self.codec.is_some()
    }

    /// Whether license negotiation has completed
    pub fn licence_issued(&self) -> bool {
        self.licence_issued
    }

    /// Record completion (or reset) of license negotiation
    ///
    /// The licensing collaborator owns the negotiation; it reports the
    /// terminal state here because the secure header layout depends on it.
    pub fn set_licence_issued(&mut self, issued: bool) {
        self.licence_issued = issued;
    }

    /// Current packet codec, if keys are established
    pub fn codec(&self) -> Option<&SecureCodec> {
        self.codec.as_ref()
    }
}
