//! Session traffic encryption
//!
//! Payloads are CBC-encrypted with ISO/IEC 7816-4 padding under the session
//! encryption key. Each transformed payload gets a fresh IV, the encryption
//! of a message counter shared by both directions. The counter keeps running
//! while encryption is switched off, so encryption can be toggled any number
//! of times within one session.

use std::fmt;

use tracing::trace;
use zeroize::Zeroizing;

use crate::Result;
use crate::constants::KEY_LEN;
use crate::crypto::{self, KeyBytes};
use crate::product::CipherSuite;

/// CBC codec for ciphered session payloads
pub struct EncryptionCodec {
    suite: CipherSuite,
    key: KeyBytes,
    counter: u32,
    active: bool,
}

impl fmt::Debug for EncryptionCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionCodec")
            .field("suite", &self.suite)
            .field("counter", &self.counter)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl EncryptionCodec {
    /// Create an inactive codec keyed with the session encryption key
    pub fn new(suite: CipherSuite, key: &[u8; KEY_LEN]) -> Self {
        Self {
            suite,
            key: Zeroizing::new(*key),
            counter: 0,
            active: false,
        }
    }

    /// Whether payloads are currently transformed
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Number of payloads transformed so far
    pub const fn counter(&self) -> u32 {
        self.counter
    }

    /// Start transforming payloads
    pub const fn activate(&mut self) {
        self.active = true;
    }

    /// Stop transforming payloads
    pub const fn deactivate(&mut self) {
        self.active = false;
    }

    /// Cipher a plaintext payload sent to the card
    pub fn cipher(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }

        let iv = self.next_iv()?;
        let ciphertext = crypto::cbc_encrypt(self.suite, self.key.as_slice(), &iv, plaintext)?;
        trace!(
            counter = self.counter,
            len = ciphertext.len(),
            "Ciphered session payload"
        );
        Ok(ciphertext)
    }

    /// Decipher a payload received from the card
    pub fn decipher(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }

        let iv = self.next_iv()?;
        let plaintext = crypto::cbc_decrypt(self.suite, self.key.as_slice(), &iv, ciphertext)?;
        trace!(
            counter = self.counter,
            len = plaintext.len(),
            "Deciphered session payload"
        );
        Ok(plaintext)
    }

    fn next_iv(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let bs = self.suite.block_size();
        let mut iv = Zeroizing::new(vec![0u8; bs]);
        iv[bs - 4..].copy_from_slice(&self.counter.to_be_bytes());
        crypto::encrypt_block(self.suite, self.key.as_slice(), &mut iv)?;
        self.counter = self.counter.wrapping_add(1);
        Ok(iv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use hex_literal::hex;

    const ENC_KEY: [u8; 16] = hex!("505152535455565758595a5b5c5d5e5f");

    /// Card-side mirror: both ends advance the same counter
    fn pair(suite: CipherSuite) -> (EncryptionCodec, EncryptionCodec) {
        (
            EncryptionCodec::new(suite, &ENC_KEY),
            EncryptionCodec::new(suite, &ENC_KEY),
        )
    }

    #[test]
    fn test_exchange_round_trip() {
        for suite in [CipherSuite::Tdes, CipherSuite::Aes128] {
            let (mut terminal, mut card) = pair(suite);

            let request = hex!("00b2014400");
            let ciphered = terminal.cipher(&request).unwrap();
            assert_eq!(ciphered.len(), suite.block_size());
            assert_eq!(card.decipher(&ciphered).unwrap(), request);

            let response = hex!("0011223344556677889900");
            let ciphered = card.cipher(&response).unwrap();
            assert_eq!(terminal.decipher(&ciphered).unwrap(), response);

            assert_eq!(terminal.counter(), 2);
        }
    }

    #[test]
    fn test_iv_changes_per_message() {
        let mut codec = EncryptionCodec::new(CipherSuite::Tdes, &ENC_KEY);
        let first = codec.cipher(&hex!("00b2014400")).unwrap();
        let second = codec.cipher(&hex!("00b2014400")).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_empty_payload_passes_through() {
        let mut codec = EncryptionCodec::new(CipherSuite::Tdes, &ENC_KEY);
        assert!(codec.cipher(&[]).unwrap().is_empty());
        assert!(codec.decipher(&[]).unwrap().is_empty());
        assert_eq!(codec.counter(), 0);
    }

    #[test]
    fn test_malformed_ciphertext() {
        let mut codec = EncryptionCodec::new(CipherSuite::Aes128, &ENC_KEY);
        assert_eq!(
            codec.decipher(&[0u8; 15]).unwrap_err(),
            Error::InvalidInput("ciphertext is not a whole number of blocks")
        );
    }

    #[test]
    fn test_toggle() {
        let mut codec = EncryptionCodec::new(CipherSuite::Tdes, &ENC_KEY);
        assert!(!codec.is_active());
        codec.activate();
        assert!(codec.is_active());
        codec.deactivate();
        assert!(!codec.is_active());
    }
}
