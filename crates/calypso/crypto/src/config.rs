//! Configuration options for secure sessions

use crate::constants::sv::SERIAL_NUMBER_LEN;
use crate::product::{ProductType, SessionProfile};

/// Configuration options for a secure session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Product type of the card, selecting challenge and certificate lengths
    pub product_type: ProductType,

    /// Whether the terminal certificate is requested right after Open Secure Session
    pub early_authentication: bool,

    /// Whether session traffic is ciphered from the first exchange
    pub session_encrypted: bool,

    /// Terminal serial number reported in SV security data
    pub terminal_serial_number: [u8; SERIAL_NUMBER_LEN],
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            product_type: ProductType::default(),
            early_authentication: false,
            session_encrypted: false,
            terminal_serial_number: [0; SERIAL_NUMBER_LEN],
        }
    }
}

impl SessionConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the card product type
    pub const fn with_product_type(mut self, product_type: ProductType) -> Self {
        self.product_type = product_type;
        self
    }

    /// Set whether an early mutual authentication is operated
    pub const fn with_early_authentication(mut self, early_authentication: bool) -> Self {
        self.early_authentication = early_authentication;
        self
    }

    /// Set whether the session is encrypted from its first exchange
    pub const fn with_session_encrypted(mut self, session_encrypted: bool) -> Self {
        self.session_encrypted = session_encrypted;
        self
    }

    /// Set the terminal serial number
    pub const fn with_terminal_serial_number(
        mut self,
        serial_number: [u8; SERIAL_NUMBER_LEN],
    ) -> Self {
        self.terminal_serial_number = serial_number;
        self
    }

    /// Session parameters selected by the product type
    pub const fn profile(&self) -> SessionProfile {
        self.product_type.profile()
    }
}
