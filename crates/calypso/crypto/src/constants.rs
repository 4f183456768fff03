//! Constants used in Calypso secure session operations
//!
//! This module gathers the key identifiers, instruction codes, fixed lengths
//! and derivation constants shared by the session, SV and key transport code.

/// Well-known Calypso key identifiers (KIF)
pub mod kif {
    /// Issuer key
    pub const ISSUER: u8 = 0x21;
    /// Load key, used to secure SV Reload
    pub const LOAD: u8 = 0x27;
    /// Debit key, used to secure SV Debit and SV Undebit
    pub const DEBIT: u8 = 0x30;
}

/// Calypso instruction codes involved in SV security computations
pub mod ins {
    /// SV Get command
    pub const SV_GET: u8 = 0x7C;
    /// SV Reload command
    pub const SV_RELOAD: u8 = 0xB8;
    /// SV Debit command
    pub const SV_DEBIT: u8 = 0xBA;
    /// SV Undebit command
    pub const SV_UNDEBIT: u8 = 0xBC;
}

/// Fixed lengths of the SV command parts
pub mod sv {
    /// SV Get command header (CLA INS P1 P2 Le)
    pub const GET_HEADER_LEN: usize = 5;
    /// SV Get response data for a reload
    pub const GET_DATA_RELOAD_LEN: usize = 33;
    /// SV Get response data for a debit or undebit
    pub const GET_DATA_DEBIT_LEN: usize = 30;
    /// SV Reload command header and data, without security data
    pub const RELOAD_DATA_LEN: usize = 18;
    /// SV Debit/Undebit command header and data, without security data
    pub const DEBIT_DATA_LEN: usize = 17;
    /// Terminal serial number
    pub const SERIAL_NUMBER_LEN: usize = 4;
    /// Terminal SV transaction number
    pub const TRANSACTION_NUMBER_LEN: usize = 3;
    /// Terminal SV challenge
    pub const TERMINAL_CHALLENGE_LEN: usize = 3;
    /// Offset of the INS byte inside a command header
    pub const INS_OFFSET: usize = 1;
    /// Offset of the SV key KVC inside the SV Get response data
    pub const KVC_OFFSET: usize = 0;
}

/// PIN value length
pub const PIN_LEN: usize = 4;

/// Length of the keys handled by the engine (3DES two-key and AES-128)
pub const KEY_LEN: usize = 16;

/// Derivation purpose for the session MAC key
pub const DERIVATION_MAC: [u8; 2] = [0x01, 0x01];
/// Derivation purpose for the session encryption key
pub const DERIVATION_ENC: [u8; 2] = [0x01, 0x82];

/// Framing tags of the messages folded into a digest
pub(crate) mod tag {
    /// Open Secure Session response
    pub(crate) const OPEN_SESSION: u8 = 0x00;
    /// Payload exchanged in plaintext mode
    pub(crate) const PLAIN: u8 = 0x01;
    /// Payload exchanged while encryption was active
    pub(crate) const CIPHERED: u8 = 0x02;
    /// SV transaction number and challenge derivation
    pub(crate) const SV_NUMBERS: u8 = 0x10;
    /// Terminal SV MAC
    pub(crate) const SV_TERMINAL: u8 = 0x11;
    /// Card SV MAC
    pub(crate) const SV_CARD: u8 = 0x12;
}
