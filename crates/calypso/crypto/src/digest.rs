//! Running session digest
//!
//! The digest is an incremental CBC-MAC keyed with the session MAC key. It
//! is seeded with the Open Secure Session response and then fed every
//! command and response payload of the session, in exchange order.
//!
//! Each payload is framed as `tag || length (2 bytes, big endian) || data`.
//! The tag records whether the payload crossed the card boundary ciphered,
//! so two sessions that exchanged the same plaintext with different
//! encryption settings end with different certificates.

use std::fmt;

use tracing::trace;
use zeroize::Zeroizing;

use crate::constants::tag;
use crate::crypto::MacState;
use crate::product::CipherSuite;
use crate::{Error, Result};

/// How a payload crossed the card boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    /// Exchanged in plaintext
    Plain,
    /// Exchanged while session encryption was active
    Ciphered,
}

impl PayloadMode {
    const fn tag(self) -> u8 {
        match self {
            Self::Plain => tag::PLAIN,
            Self::Ciphered => tag::CIPHERED,
        }
    }
}

type Exchange = (Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>);

/// Incremental MAC over the payloads of a secure session
///
/// The MAC chaining value and the stored exchanges are wiped when the
/// accumulator is dropped.
#[derive(Clone)]
pub struct DigestAccumulator {
    mac: MacState,
    /// Exchanges stored by bulk ingestion, folded before the next digest operation
    pending: Vec<Exchange>,
    folded: usize,
}

impl fmt::Debug for DigestAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestAccumulator")
            .field("mac", &self.mac)
            .field("pending", &self.pending.len())
            .field("folded", &self.folded)
            .finish()
    }
}

impl DigestAccumulator {
    /// Create a digest keyed with `mac_key` and seeded with the Open Secure Session response
    pub fn new(suite: CipherSuite, mac_key: &[u8], open_session_data_out: &[u8]) -> Result<Self> {
        if open_session_data_out.is_empty() {
            return Err(Error::InvalidInput("empty Open Secure Session data"));
        }

        let mut digest = Self {
            mac: MacState::new(suite, mac_key)?,
            pending: Vec::new(),
            folded: 0,
        };
        digest.fold_framed(tag::OPEN_SESSION, open_session_data_out)?;
        Ok(digest)
    }

    /// Fold one command or response payload into the digest
    ///
    /// Exchanges stored by [`defer_exchanges`](Self::defer_exchanges) are
    /// folded first so the digest always follows exchange order.
    pub fn fold(&mut self, mode: PayloadMode, payload: &[u8]) -> Result<()> {
        self.flush()?;
        self.fold_framed(mode.tag(), payload)
    }

    /// Store plaintext exchanges whose digest computation may be performed later
    ///
    /// The result is the same as folding each data in then data out, in order.
    /// Nothing is stored if any payload cannot be framed.
    pub fn defer_exchanges<I, O>(
        &mut self,
        exchanges: impl IntoIterator<Item = (I, O)>,
    ) -> Result<()>
    where
        I: AsRef<[u8]>,
        O: AsRef<[u8]>,
    {
        let mut deferred = Vec::new();
        for (data_in, data_out) in exchanges {
            deferred.push((stored(data_in.as_ref())?, stored(data_out.as_ref())?));
        }

        if deferred.is_empty() {
            return Err(Error::InvalidInput("empty list of card exchanges"));
        }

        trace!(count = deferred.len(), "Deferring digest update");
        self.pending.extend(deferred);
        Ok(())
    }

    /// Number of stored exchanges not yet folded
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of payloads folded so far, the Open Secure Session response included
    pub const fn folded(&self) -> usize {
        self.folded
    }

    /// Compute the digest of everything ingested so far without consuming the accumulator
    pub fn snapshot(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        self.flush()?;
        Ok(self.mac.clone().finalize())
    }

    /// Consume the accumulator and return the final block-sized digest
    pub fn finalize(mut self) -> Result<Zeroizing<Vec<u8>>> {
        self.flush()?;
        Ok(self.mac.finalize())
    }

    fn flush(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for (data_in, data_out) in &pending {
            self.fold_framed(tag::PLAIN, data_in)?;
            self.fold_framed(tag::PLAIN, data_out)?;
        }
        Ok(())
    }

    fn fold_framed(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let len = frame_len(payload)?;

        self.mac.update(&[tag]);
        self.mac.update(&len.to_be_bytes());
        self.mac.update(payload);
        self.folded += 1;

        trace!(tag, len, "Folded payload into session digest");
        Ok(())
    }
}

const OVERSIZED: Error = Error::InvalidInput("payload longer than 65535 bytes");

fn frame_len(payload: &[u8]) -> Result<u16> {
    u16::try_from(payload.len()).map_err(|_| OVERSIZED)
}

fn stored(payload: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    frame_len(payload)?;
    Ok(Zeroizing::new(payload.to_vec()))
}
