//! Configuration management
//!
//! Handles loading and validation of client configuration from TOML files.
//! Every field has a sensible default so `ClientConfig::default()` is a
//! usable configuration on its own.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client hostname advertised to the server (truncated to 15 characters
    /// on the wire)
    pub hostname: String,
    /// Desktop width in pixels
    pub width: u16,
    /// Desktop height in pixels
    pub height: u16,
    /// Keyboard layout identifier
    pub keyboard_layout: u32,
    /// Keyboard type
    pub keyboard_type: u32,
    /// Keyboard subtype
    pub keyboard_subtype: u32,
    /// Number of keyboard function keys
    pub keyboard_functionkeys: u32,
    /// Request standard encryption
    pub encryption: bool,
    /// Request a console (admin) session
    pub console_session: bool,
    /// Enable RDP5 features; downgraded automatically for old servers
    pub use_rdp5: bool,
    /// Requested colour depth in bits per pixel
    pub server_depth: u8,
    /// Virtual channels to request at connect time
    pub channels: Vec<ChannelDef>,
}

/// One requested virtual channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDef {
    /// Channel name, at most 7 ASCII characters
    pub name: String,
    /// Channel option flags
    pub flags: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            width: 1024,
            height: 768,
            keyboard_layout: 0x409, // US
            keyboard_type: 4,       // IBM enhanced
            keyboard_subtype: 0,
            keyboard_functionkeys: 12,
            encryption: true,
            console_session: false,
            use_rdp5: true,
            server_depth: 24,
            channels: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: ClientConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            anyhow::bail!("Hostname must not be empty");
        }

        if self.width == 0 || self.height == 0 {
            anyhow::bail!("Invalid desktop size: {}x{}", self.width, self.height);
        }

        match self.server_depth {
            8 | 15 | 16 | 24 => {}
            _ => anyhow::bail!("Invalid colour depth: {}", self.server_depth),
        }

        for channel in &self.channels {
            if channel.name.is_empty() || channel.name.len() > 7 {
                anyhow::bail!("Invalid channel name: {:?}", channel.name);
            }
            if !channel.name.is_ascii() {
                anyhow::bail!("Channel name must be ASCII: {:?}", channel.name);
            }
        }

        Ok(())
    }
}
