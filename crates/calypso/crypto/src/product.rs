//! Calypso product types and the session parameters they select

use derive_more::Display;

/// Block cipher family used by a session
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    /// Two-key Triple-DES (EDE), 8-byte blocks
    #[display("3DES")]
    Tdes,
    /// AES-128, 16-byte blocks
    #[display("AES-128")]
    Aes128,
}

impl CipherSuite {
    /// Block size in bytes
    pub const fn block_size(self) -> usize {
        match self {
            Self::Tdes => 8,
            Self::Aes128 => 16,
        }
    }
}

/// Calypso card product type
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ProductType {
    /// Calypso Prime revision 1
    #[display("Prime revision 1")]
    PrimeRevision1,
    /// Calypso Prime revision 2
    #[display("Prime revision 2")]
    PrimeRevision2,
    /// Calypso Prime revision 3
    #[default]
    #[display("Prime revision 3")]
    PrimeRevision3,
    /// Calypso Prime revision 3 operated in extended mode
    #[display("Prime revision 3 (extended)")]
    PrimeRevision3Extended,
    /// Calypso Light
    #[display("Light")]
    Light,
    /// Calypso Basic
    #[display("Basic")]
    Basic,
}

impl ProductType {
    /// Session parameters selected by this product type
    pub const fn profile(self) -> SessionProfile {
        match self {
            Self::PrimeRevision3Extended => SessionProfile::EXTENDED,
            Self::PrimeRevision1
            | Self::PrimeRevision2
            | Self::PrimeRevision3
            | Self::Light
            | Self::Basic => SessionProfile::REGULAR,
        }
    }
}

/// Challenge, certificate and MAC lengths of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionProfile {
    /// Cipher family
    pub cipher: CipherSuite,
    /// Card challenge length
    pub card_challenge_len: usize,
    /// Terminal challenge length
    pub terminal_challenge_len: usize,
    /// Session certificate length (terminal and card)
    pub certificate_len: usize,
    /// Terminal SV MAC length
    pub terminal_sv_mac_len: usize,
    /// Card SV MAC length
    pub card_sv_mac_len: usize,
}

impl SessionProfile {
    /// Regular mode: 3DES, 4-byte challenges and certificates
    pub const REGULAR: Self = Self {
        cipher: CipherSuite::Tdes,
        card_challenge_len: 4,
        terminal_challenge_len: 4,
        certificate_len: 4,
        terminal_sv_mac_len: 5,
        card_sv_mac_len: 3,
    };

    /// Extended mode: AES-128, 8-byte challenges and certificates
    pub const EXTENDED: Self = Self {
        cipher: CipherSuite::Aes128,
        card_challenge_len: 8,
        terminal_challenge_len: 8,
        certificate_len: 8,
        terminal_sv_mac_len: 10,
        card_sv_mac_len: 6,
    };
}
