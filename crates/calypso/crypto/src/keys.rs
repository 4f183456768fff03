//! Key material and the key back end seam
//!
//! The engine never stores base keys itself: it asks a [`KeyBackend`] to
//! resolve a (KIF, KVC) pair and to diversify the resolved key with the card
//! diversifier. [`SoftwareKeyStore`] is the in-memory back end; hardware
//! back ends implement the same trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Error, Result, constants::KEY_LEN, crypto, product::CipherSuite};

/// Key identifier pair selecting a key known to the terminal and the card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyReference {
    /// Key identifier
    pub kif: u8,
    /// Key version
    pub kvc: u8,
}

impl KeyReference {
    /// Create a key reference
    pub const fn new(kif: u8, kvc: u8) -> Self {
        Self { kif, kvc }
    }

    /// The error reported when this reference cannot be resolved
    pub const fn not_found(self) -> Error {
        Error::KeyNotFound {
            kif: self.kif,
            kvc: self.kvc,
        }
    }
}

/// A 16-byte working key, zeroised on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WorkKey {
    bytes: [u8; KEY_LEN],
}

impl fmt::Debug for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkKey(..)")
    }
}

impl WorkKey {
    /// Wrap raw key bytes
    pub const fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Build a key from a slice, which must be exactly 16 bytes long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| Error::InvalidLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self { bytes })
    }

    /// Get the raw key bytes
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

/// Provider of base keys and key diversification
///
/// Implementations must be safe to share between concurrent sessions: the
/// engine only ever reads from them.
pub trait KeyBackend {
    /// Resolve a (KIF, KVC) pair to its base key
    ///
    /// Fails with [`Error::KeyNotFound`] if the pair is unknown.
    fn resolve(&self, kif: u8, kvc: u8) -> Result<WorkKey>;

    /// Derive the card-specific key from a base key and the card diversifier
    fn diversify(&self, key: &WorkKey, diversifier: &[u8], suite: CipherSuite) -> Result<WorkKey> {
        let derived = crypto::diversify(suite, key.as_bytes(), diversifier)?;
        Ok(WorkKey::new(*derived))
    }

    /// Resolve a key and diversify it for the current card
    fn card_key(
        &self,
        kif: u8,
        kvc: u8,
        diversifier: &[u8],
        suite: CipherSuite,
    ) -> Result<WorkKey> {
        let base = self.resolve(kif, kvc)?;
        self.diversify(&base, diversifier, suite)
    }
}

impl<T: KeyBackend + ?Sized> KeyBackend for &T {
    fn resolve(&self, kif: u8, kvc: u8) -> Result<WorkKey> {
        (**self).resolve(kif, kvc)
    }

    fn diversify(&self, key: &WorkKey, diversifier: &[u8], suite: CipherSuite) -> Result<WorkKey> {
        (**self).diversify(key, diversifier, suite)
    }
}

impl<T: KeyBackend + ?Sized> KeyBackend for Arc<T> {
    fn resolve(&self, kif: u8, kvc: u8) -> Result<WorkKey> {
        (**self).resolve(kif, kvc)
    }

    fn diversify(&self, key: &WorkKey, diversifier: &[u8], suite: CipherSuite) -> Result<WorkKey> {
        (**self).diversify(key, diversifier, suite)
    }
}

/// In-memory key back end
#[derive(Clone, Default)]
pub struct SoftwareKeyStore {
    keys: HashMap<KeyReference, WorkKey>,
}

impl fmt::Debug for SoftwareKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKeyStore")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SoftwareKeyStore {
    /// Create an empty key store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, replacing any previous key with the same reference
    pub fn insert(&mut self, kif: u8, kvc: u8, key: [u8; KEY_LEN]) {
        self.keys
            .insert(KeyReference::new(kif, kvc), WorkKey::new(key));
    }

    /// Builder-style variant of [`insert`](Self::insert)
    pub fn with_key(mut self, kif: u8, kvc: u8, key: [u8; KEY_LEN]) -> Self {
        self.insert(kif, kvc, key);
        self
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the store holds no key
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyBackend for SoftwareKeyStore {
    fn resolve(&self, kif: u8, kvc: u8) -> Result<WorkKey> {
        let reference = KeyReference::new(kif, kvc);
        self.keys
            .get(&reference)
            .cloned()
            .ok_or_else(|| reference.not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_resolve() {
        let store = SoftwareKeyStore::new().with_key(0x21, 0x79, [0x11; 16]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.resolve(0x21, 0x79).unwrap().as_bytes(), &[0x11; 16]);
        assert_eq!(
            store.resolve(0x21, 0x7A).unwrap_err(),
            Error::KeyNotFound {
                kif: 0x21,
                kvc: 0x7A
            }
        );
    }

    #[test]
    fn test_card_key_through_shared_backends() {
        fn card_key_via<B: KeyBackend>(backend: B, diversifier: &[u8]) -> WorkKey {
            backend
                .card_key(0x30, 0x79, diversifier, CipherSuite::Tdes)
                .unwrap()
        }

        let store = Arc::new(SoftwareKeyStore::new().with_key(0x30, 0x79, [0x22; 16]));
        let diversifier = hex!("0102030405060708");

        let direct = store
            .card_key(0x30, 0x79, &diversifier, CipherSuite::Tdes)
            .unwrap();
        let by_ref = card_key_via(&*store, &diversifier);
        let shared = card_key_via(Arc::clone(&store), &diversifier);
        assert_eq!(direct.as_bytes(), by_ref.as_bytes());
        assert_eq!(direct.as_bytes(), shared.as_bytes());
        assert_ne!(direct.as_bytes(), &[0x22; 16]);

        assert!(matches!(
            store.card_key(0x31, 0x79, &diversifier, CipherSuite::Tdes),
            Err(Error::KeyNotFound { kif: 0x31, .. })
        ));
    }

    #[test]
    fn test_work_key_from_slice() {
        assert!(WorkKey::from_slice(&[0u8; 16]).is_ok());
        assert_eq!(
            WorkKey::from_slice(&[0u8; 8]).unwrap_err(),
            Error::InvalidLength {
                expected: 16,
                actual: 8
            }
        );
        assert_eq!(format!("{:?}", WorkKey::new([0x42; 16])), "WorkKey(..)");
    }
}
