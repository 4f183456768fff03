//! Ciphered PIN blocks and key loading blocks
//!
//! PIN values and card keys never cross the card boundary in plaintext: they
//! are ciphered together with the card challenge of the current session
//! under a key diversified for the card, so a captured block cannot be
//! replayed in another session.

use bytes::Bytes;
use tracing::debug;
use zeroize::Zeroizing;

use crate::constants::PIN_LEN;
use crate::crypto;
use crate::keys::KeyBackend;
use crate::session::{Operation, SessionContext};
use crate::{Error, Result};

const fn check_pin(pin: &[u8]) -> Result<()> {
    if pin.len() != PIN_LEN {
        return Err(Error::InvalidInput("PIN must be 4 bytes long"));
    }
    Ok(())
}

impl<K: KeyBackend> SessionContext<K> {
    /// Cipher a PIN for the Verify PIN command
    ///
    /// The block is `E(pin || card challenge)` under the card key
    /// (kif, kvc), zero padded to a whole number of blocks.
    pub fn cipher_pin_for_presentation(&mut self, pin: &[u8], kif: u8, kvc: u8) -> Result<Bytes> {
        self.run(Operation::CipherPin, |session| {
            check_pin(pin)?;
            session.cipher_with_card_challenge(Operation::CipherPin, kif, kvc, &[pin])
        })
    }

    /// Cipher the current and new PIN for the Change PIN command
    ///
    /// The block is `E(current || new || card challenge)` under the card key
    /// (kif, kvc), zero padded to a whole number of blocks.
    pub fn cipher_pin_for_modification(
        &mut self,
        current_pin: &[u8],
        new_pin: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<Bytes> {
        self.run(Operation::CipherPin, |session| {
            check_pin(current_pin)?;
            check_pin(new_pin)?;
            session.cipher_with_card_challenge(
                Operation::CipherPin,
                kif,
                kvc,
                &[current_pin, new_pin],
            )
        })
    }

    /// Build the ciphered block of a Change Key command
    ///
    /// The target key is diversified for the card and ciphered, followed by
    /// its KIF, its KVC and the card challenge, under the diversified issuer
    /// key.
    pub fn generate_card_key(
        &mut self,
        issuer_kif: u8,
        issuer_kvc: u8,
        target_kif: u8,
        target_kvc: u8,
    ) -> Result<Bytes> {
        self.run(Operation::GenerateCardKey, |session| {
            let target = session.card_key(target_kif, target_kvc)?;
            let block = session.cipher_with_card_challenge(
                Operation::GenerateCardKey,
                issuer_kif,
                issuer_kvc,
                &[&target.as_bytes()[..], &[target_kif, target_kvc][..]],
            )?;
            debug!(
                issuer_kif,
                issuer_kvc,
                target_kif,
                target_kvc,
                "Card key block generated"
            );
            Ok(block)
        })
    }

    fn cipher_with_card_challenge(
        &self,
        operation: Operation,
        kif: u8,
        kvc: u8,
        secrets: &[&[u8]],
    ) -> Result<Bytes> {
        let card_challenge = self.card_challenge(operation)?;
        let key = self.card_key(kif, kvc)?;

        let len = secrets.iter().map(|part| part.len()).sum::<usize>() + card_challenge.len();
        let mut plaintext = Zeroizing::new(Vec::with_capacity(len));
        for part in secrets {
            plaintext.extend_from_slice(part);
        }
        plaintext.extend_from_slice(card_challenge);

        let block = crypto::encrypt_zero_padded(self.profile().cipher, key.as_bytes(), &plaintext)?;
        debug!(kif, kvc, len = block.len(), "Secret block ciphered");
        Ok(Bytes::from(block))
    }
}
