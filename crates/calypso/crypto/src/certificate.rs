//! Card certificate verification
//!
//! Finalizing the session digest yields both the terminal certificate and
//! the certificate the card is expected to return in the Close Secure
//! Session response. A mismatch is a normal outcome of a failed mutual
//! authentication and is reported as `false`, never as an error.

use tracing::debug;

use crate::keys::KeyBackend;
use crate::session::{Operation, SessionContext, State};
use crate::{Result, crypto};

impl<K: KeyBackend> SessionContext<K> {
    /// Check the card session certificate returned by Close Secure Session
    ///
    /// Only valid once the terminal certificate has been finalized. The
    /// comparison runs in constant time; a value of the wrong length does not
    /// match.
    pub fn verify_card_session_mac(&mut self, card_mac: &[u8]) -> Result<bool> {
        self.run(Operation::VerifyCardSessionMac, |session| {
            let State::Closed(closed) = &session.state else {
                return Err(session.wrong_state(Operation::VerifyCardSessionMac));
            };

            let verified = crypto::ct_eq(closed.expected_card_certificate(), card_mac);
            session.card_authenticated |= verified;
            debug!(verified, "Card session certificate checked");
            Ok(verified)
        })
    }

    /// Check the card certificate of the mutual authentication
    ///
    /// Same comparison as [`verify_card_session_mac`](Self::verify_card_session_mac).
    pub fn verify_card_certificate(&mut self, card_certificate: &[u8]) -> Result<bool> {
        self.verify_card_session_mac(card_certificate)
    }
}
