//! Cryptographic operations for Calypso secure sessions
//!
//! This module provides the block cipher primitives shared by the session
//! digest, the session encryption and the auxiliary security computations:
//! key diversification, session key derivation, CBC-MAC (ISO/IEC 9797-1
//! algorithm 1, padding method 2) and CBC encryption.
//!
//! Regular products use two-key Triple-DES, extended products AES-128. Both
//! use 16-byte keys.

use std::fmt;

use aes::Aes128;
use cbc_mac::{CbcMac, Mac};
use cipher::{
    BlockCipher, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit,
    block_padding::{Iso7816, NoPadding, ZeroPadding},
    generic_array::GenericArray,
};
use des::TdesEde2;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::constants::{DERIVATION_ENC, DERIVATION_MAC, KEY_LEN};
use crate::error::{Error, Result, check_length};
use crate::product::CipherSuite;

/// Raw key bytes, zeroised on drop
pub type KeyBytes = Zeroizing<[u8; KEY_LEN]>;

/// First byte of the ISO/IEC 9797-1 padding method 2
const MAC_PADDING: u8 = 0x80;

macro_rules! with_cipher {
    ($suite:expr, $f:ident($($arg:expr),* $(,)?)) => {
        match $suite {
            CipherSuite::Tdes => $f::<TdesEde2>($($arg),*),
            CipherSuite::Aes128 => $f::<Aes128>($($arg),*),
        }
    };
}

/// Session keys derived from the card key and both challenges
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    mac: [u8; KEY_LEN],
    enc: [u8; KEY_LEN],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys").finish_non_exhaustive()
    }
}

impl SessionKeys {
    /// Get the session MAC key
    pub const fn mac(&self) -> &[u8; KEY_LEN] {
        &self.mac
    }

    /// Get the session encryption key
    pub const fn enc(&self) -> &[u8; KEY_LEN] {
        &self.enc
    }
}

/// Encrypt a single block in place
///
/// `block` must be exactly one block of the selected cipher.
pub fn encrypt_block(suite: CipherSuite, key: &[u8], block: &mut [u8]) -> Result<()> {
    with_cipher!(suite, encrypt_block_with(key, block))
}

fn encrypt_block_with<C: BlockEncrypt + KeyInit>(key: &[u8], block: &mut [u8]) -> Result<()> {
    check_length(block, C::block_size())?;
    let cipher = C::new_from_slice(key)?;
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
    Ok(())
}

/// Diversify a base key with a card-specific value
///
/// The diversifier is right-aligned in a zero block (diversifiers longer than
/// a block are first reduced with a CBC-MAC under the base key). The derived
/// key is `E(d)` for AES and `E(d) || E(!d)` for 3DES.
pub fn diversify(suite: CipherSuite, base_key: &[u8], diversifier: &[u8]) -> Result<KeyBytes> {
    if diversifier.is_empty() {
        return Err(Error::InvalidInput("empty key diversifier"));
    }

    let bs = suite.block_size();
    let mut block = Zeroizing::new(vec![0u8; bs]);
    if diversifier.len() <= bs {
        block[bs - diversifier.len()..].copy_from_slice(diversifier);
    } else {
        let reduced = compute_mac(suite, base_key, &[diversifier])?;
        block.copy_from_slice(&reduced);
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    for (i, chunk) in key.chunks_mut(bs).enumerate() {
        chunk.copy_from_slice(&block);
        if i % 2 == 1 {
            chunk.iter_mut().for_each(|b| *b = !*b);
        }
        encrypt_block(suite, base_key, chunk)?;
    }

    Ok(key)
}

/// Derive the session base key from the card key and both challenges
///
/// The challenges together fill exactly one block. The session key is
/// `E(TC || CC)` for AES and `E(TC || CC) || E(CC || TC)` for 3DES.
pub fn derive_session_key(
    suite: CipherSuite,
    card_key: &[u8],
    terminal_challenge: &[u8],
    card_challenge: &[u8],
) -> Result<KeyBytes> {
    let bs = suite.block_size();
    if terminal_challenge.len() + card_challenge.len() != bs {
        return Err(Error::InvalidInput(
            "challenges do not fill one cipher block",
        ));
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    for (i, chunk) in key.chunks_mut(bs).enumerate() {
        let (first, second) = if i % 2 == 0 {
            (terminal_challenge, card_challenge)
        } else {
            (card_challenge, terminal_challenge)
        };
        chunk[..first.len()].copy_from_slice(first);
        chunk[first.len()..].copy_from_slice(second);
        encrypt_block(suite, card_key, chunk)?;
    }

    Ok(key)
}

/// Derive a purpose-specific key from a session base key
///
/// The purpose is placed in the first two bytes of a zero buffer which is
/// then CBC-encrypted with a zero IV.
pub fn derive_key(suite: CipherSuite, base_key: &[u8], purpose: &[u8; 2]) -> Result<KeyBytes> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key[..2].copy_from_slice(purpose);
    let iv = vec![0u8; suite.block_size()];
    with_cipher!(
        suite,
        cbc_encrypt_aligned(base_key, &iv, key.as_mut_slice())
    )?;
    Ok(key)
}

/// Derive the session MAC and encryption keys
pub fn derive_session_keys(
    suite: CipherSuite,
    card_key: &[u8],
    terminal_challenge: &[u8],
    card_challenge: &[u8],
) -> Result<SessionKeys> {
    let base = derive_session_key(suite, card_key, terminal_challenge, card_challenge)?;
    let mac = derive_key(suite, base.as_slice(), &DERIVATION_MAC)?;
    let enc = derive_key(suite, base.as_slice(), &DERIVATION_ENC)?;

    Ok(SessionKeys {
        mac: *mac,
        enc: *enc,
    })
}

fn cbc_encrypt_aligned<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let len = buf.len();
    cbc::Encryptor::<C>::new_from_slices(key, iv)?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| Error::Crypto("data is not block aligned"))?;
    Ok(())
}

/// CBC-encrypt data with ISO/IEC 7816-4 padding
pub fn cbc_encrypt(suite: CipherSuite, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    with_cipher!(suite, cbc_encrypt_with(key, iv, data))
}

fn cbc_encrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv)?;
    Ok(encryptor.encrypt_padded_vec_mut::<Iso7816>(data))
}

/// CBC-decrypt data and remove its ISO/IEC 7816-4 padding
pub fn cbc_decrypt(suite: CipherSuite, key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % suite.block_size() != 0 {
        return Err(Error::InvalidInput(
            "ciphertext is not a whole number of blocks",
        ));
    }
    with_cipher!(suite, cbc_decrypt_with(key, iv, data))
}

fn cbc_decrypt_with<C>(key: &[u8], iv: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    cbc::Decryptor::<C>::new_from_slices(key, iv)?
        .decrypt_padded_vec_mut::<Iso7816>(data)
        .map_err(|_| Error::InvalidInput("invalid ciphertext padding"))
}

/// CBC-encrypt a fixed-layout block with a zero IV, zero-padding the tail
pub(crate) fn encrypt_zero_padded(suite: CipherSuite, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    with_cipher!(suite, encrypt_zero_padded_with(key, data))
}

fn encrypt_zero_padded_with<C>(key: &[u8], data: &[u8]) -> Result<Vec<u8>>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let iv = vec![0u8; C::block_size()];
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, &iv)?;
    Ok(encryptor.encrypt_padded_vec_mut::<ZeroPadding>(data))
}

/// Incremental CBC-MAC state
#[derive(Clone)]
pub(crate) enum MacState {
    Tdes(CbcMac<TdesEde2>),
    Aes128(CbcMac<Aes128>),
}

impl fmt::Debug for MacState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suite = match self {
            Self::Tdes(_) => CipherSuite::Tdes,
            Self::Aes128(_) => CipherSuite::Aes128,
        };
        f.debug_tuple("MacState").field(&suite).finish()
    }
}

impl MacState {
    pub(crate) fn new(suite: CipherSuite, key: &[u8]) -> Result<Self> {
        Ok(match suite {
            CipherSuite::Tdes => Self::Tdes(<CbcMac<TdesEde2> as Mac>::new_from_slice(key)?),
            CipherSuite::Aes128 => Self::Aes128(<CbcMac<Aes128> as Mac>::new_from_slice(key)?),
        })
    }

    pub(crate) fn update(&mut self, data: &[u8]) {
        match self {
            Self::Tdes(mac) => mac.update(data),
            Self::Aes128(mac) => mac.update(data),
        }
    }

    /// Apply padding method 2 and return the block-sized MAC
    pub(crate) fn finalize(mut self) -> Zeroizing<Vec<u8>> {
        // The zero padding of the final partial block completes method 2
        self.update(&[MAC_PADDING]);
        Zeroizing::new(match self {
            Self::Tdes(mac) => mac.finalize().into_bytes().to_vec(),
            Self::Aes128(mac) => mac.finalize().into_bytes().to_vec(),
        })
    }
}

/// Compute a one-shot CBC-MAC over the concatenation of `parts`
pub fn compute_mac(suite: CipherSuite, key: &[u8], parts: &[&[u8]]) -> Result<Zeroizing<Vec<u8>>> {
    let mut mac = MacState::new(suite, key)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize())
}

/// Compare two byte strings in constant time
///
/// Strings of different lengths never match.
pub fn ct_eq(expected: &[u8], presented: &[u8]) -> bool {
    expected.ct_eq(presented).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const AES_KEY: [u8; 16] = hex!("000102030405060708090a0b0c0d0e0f");
    const DES_KEY: [u8; 16] = hex!("133457799bbcdff1133457799bbcdff1");

    #[test]
    fn test_encrypt_block() {
        let mut block = hex!("00112233445566778899aabbccddeeff");
        encrypt_block(CipherSuite::Aes128, &AES_KEY, &mut block).unwrap();
        assert_eq!(block, hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));

        // Two-key EDE with identical halves degrades to single DES
        let mut block = hex!("0123456789abcdef");
        encrypt_block(CipherSuite::Tdes, &DES_KEY, &mut block).unwrap();
        assert_eq!(block, hex!("85e813540f0ab405"));

        let mut short = [0u8; 7];
        let result = encrypt_block(CipherSuite::Tdes, &DES_KEY, &mut short);
        assert!(result.is_err());
    }

    #[test]
    fn test_diversify() {
        let key = diversify(
            CipherSuite::Aes128,
            &AES_KEY,
            &hex!("00112233445566778899aabbccddeeff"),
        )
        .unwrap();
        assert_eq!(key.as_slice(), hex!("69c4e0d86a7b0430d8cdb78070b4c55a"));

        let key = diversify(CipherSuite::Tdes, &DES_KEY, &hex!("0123456789abcdef")).unwrap();
        assert_eq!(key[..8], hex!("85e813540f0ab405"));
        assert_ne!(key[..8], key[8..]);
    }

    #[test]
    fn test_diversify_short_and_long() {
        let short = diversify(CipherSuite::Tdes, &DES_KEY, &hex!("0708")).unwrap();
        let padded = diversify(CipherSuite::Tdes, &DES_KEY, &hex!("0000000000000708")).unwrap();
        assert_eq!(short.as_slice(), padded.as_slice());

        let long = diversify(CipherSuite::Tdes, &DES_KEY, &hex!("000102030405060708")).unwrap();
        assert_ne!(long.as_slice(), padded.as_slice());

        assert_eq!(
            diversify(CipherSuite::Tdes, &DES_KEY, &[]).unwrap_err(),
            Error::InvalidInput("empty key diversifier")
        );
    }

    #[test]
    fn test_derive_session_keys() {
        let keys = derive_session_keys(
            CipherSuite::Tdes,
            &DES_KEY,
            &hex!("01020304"),
            &hex!("aabbccdd"),
        )
        .unwrap();
        assert_ne!(keys.mac(), keys.enc());

        let again = derive_session_keys(
            CipherSuite::Tdes,
            &DES_KEY,
            &hex!("01020304"),
            &hex!("aabbccdd"),
        )
        .unwrap();
        assert_eq!(keys.mac(), again.mac());

        let other = derive_session_keys(
            CipherSuite::Tdes,
            &DES_KEY,
            &hex!("01020305"),
            &hex!("aabbccdd"),
        )
        .unwrap();
        assert_ne!(keys.mac(), other.mac());

        // Challenges must fill exactly one block
        let result = derive_session_keys(
            CipherSuite::Aes128,
            &AES_KEY,
            &hex!("01020304"),
            &hex!("aabbccdd"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_compute_mac() {
        let data = hex!("0102030405060708090a");
        let whole = compute_mac(CipherSuite::Tdes, &DES_KEY, &[&data]).unwrap();
        let split = compute_mac(
            CipherSuite::Tdes,
            &DES_KEY,
            &[&hex!("010203"), &hex!("0405060708090a")],
        )
        .unwrap();
        assert_eq!(whole.len(), 8);
        assert_eq!(whole.as_slice(), split.as_slice());

        let aes = compute_mac(CipherSuite::Aes128, &AES_KEY, &[&hex!("0102")]).unwrap();
        assert_eq!(aes.len(), 16);

        // Padding method 2 distinguishes a trailing zero byte
        let data = hex!("0102030405060708090a00");
        let zero = compute_mac(CipherSuite::Tdes, &DES_KEY, &[&data]).unwrap();
        assert_ne!(whole.as_slice(), zero.as_slice());
    }

    #[test]
    fn test_cbc_round_trip_and_bad_padding() {
        let iv = [0u8; 8];
        let data = hex!("00b2010c00");
        let encrypted = cbc_encrypt(CipherSuite::Tdes, &DES_KEY, &iv, &data).unwrap();
        assert_eq!(encrypted.len(), 8);
        assert_eq!(
            cbc_decrypt(CipherSuite::Tdes, &DES_KEY, &iv, &encrypted).unwrap(),
            data
        );

        let truncated = cbc_decrypt(CipherSuite::Tdes, &DES_KEY, &iv, &encrypted[..7]);
        assert!(truncated.is_err());
        let mut garbage = [0u8; 8];
        encrypt_block(CipherSuite::Tdes, &DES_KEY, &mut garbage).unwrap();
        assert_eq!(
            cbc_decrypt(CipherSuite::Tdes, &DES_KEY, &iv, &garbage).unwrap_err(),
            Error::InvalidInput("invalid ciphertext padding")
        );
    }

    #[test]
    fn test_encrypt_zero_padded_lengths() {
        let data = hex!("0102030405060708");
        let block = encrypt_zero_padded(CipherSuite::Tdes, &DES_KEY, &data).unwrap();
        assert_eq!(block.len(), 8);
        let block = encrypt_zero_padded(CipherSuite::Aes128, &AES_KEY, &hex!("010203")).unwrap();
        assert_eq!(block.len(), 16);
    }

    #[test]
    fn test_ct_eq() {
        assert!(ct_eq(&hex!("01020304"), &hex!("01020304")));
        assert!(!ct_eq(&hex!("01020304"), &hex!("01020305")));
        assert!(!ct_eq(&hex!("01020304"), &hex!("010203")));
    }
}
