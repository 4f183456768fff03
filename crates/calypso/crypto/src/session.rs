//! Secure session state machine
//!
//! A [`SessionContext`] drives one Calypso Secure Session from the terminal
//! side: it generates the terminal challenge, derives the session keys from
//! the card key and both challenges, accumulates the session digest over the
//! exchanged payloads, ciphers and deciphers session traffic, and produces
//! the terminal certificate.
//!
//! Every public operation is checked against [`SessionState::allows`] before
//! any work is done. An error raised while the session is still live aborts
//! it and zeroises all retained key and digest material.

use std::fmt;

use bytes::Bytes;
use derive_more::Display;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use crate::codec::EncryptionCodec;
use crate::config::SessionConfig;
use crate::crypto;
use crate::digest::{DigestAccumulator, PayloadMode};
use crate::error::check_length;
use crate::keys::{KeyBackend, WorkKey};
use crate::product::SessionProfile;
use crate::{Error, Result};

/// Observable state of a secure session
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No challenge has been generated yet
    #[display("uninitialized")]
    Uninitialized,
    /// Both challenges are known, the digest is not open yet
    #[display("context ready")]
    ContextReady,
    /// The session digest is accumulating payloads
    #[display("digest open")]
    DigestOpen,
    /// The terminal certificate has been produced
    #[display("closed")]
    Closed,
    /// The session failed or was abandoned; all material is gone
    #[display("aborted")]
    Aborted,
}

/// Session operation, as checked against the state transition table
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Set the card key diversifier
    #[display("set_key_diversifier")]
    SetKeyDiversifier,
    /// Generate the terminal challenge
    #[display("init_terminal_secure_session_context")]
    InitSessionContext,
    /// Open the session digest
    #[display("init_terminal_session_mac")]
    InitSessionMac,
    /// Fold one payload into the digest
    #[display("update_terminal_session_mac")]
    UpdateSessionMac,
    /// Store exchanges for a deferred digest update
    #[display("prepare_digest_update")]
    PrepareDigestUpdate,
    /// Early terminal certificate
    #[display("generate_terminal_session_mac")]
    GenerateSessionMac,
    /// Final terminal certificate
    #[display("finalize_terminal_session_mac")]
    FinalizeSessionMac,
    /// Start ciphering session traffic
    #[display("activate_encryption")]
    ActivateEncryption,
    /// Stop ciphering session traffic
    #[display("deactivate_encryption")]
    DeactivateEncryption,
    /// Check the card session certificate
    #[display("verify_card_session_mac")]
    VerifyCardSessionMac,
    /// Compute Stored Value command security data
    #[display("compute_sv_security_data")]
    ComputeSvSecurityData,
    /// Check the card Stored Value certificate
    #[display("verify_sv_card_mac")]
    VerifySvCardMac,
    /// Cipher a PIN presentation or modification block
    #[display("cipher_pin")]
    CipherPin,
    /// Cipher a key loading block
    #[display("generate_card_key")]
    GenerateCardKey,
}

impl SessionState {
    /// Whether `operation` may be invoked in this state
    pub const fn allows(self, operation: Operation) -> bool {
        use Operation as Op;

        match self {
            Self::Uninitialized => {
                matches!(operation, Op::SetKeyDiversifier | Op::InitSessionContext)
            }
            Self::ContextReady => matches!(
                operation,
                Op::InitSessionContext
                    | Op::InitSessionMac
                    | Op::ComputeSvSecurityData
                    | Op::VerifySvCardMac
                    | Op::CipherPin
                    | Op::GenerateCardKey
            ),
            Self::DigestOpen => matches!(
                operation,
                Op::UpdateSessionMac
                    | Op::PrepareDigestUpdate
                    | Op::GenerateSessionMac
                    | Op::FinalizeSessionMac
                    | Op::ActivateEncryption
                    | Op::DeactivateEncryption
                    | Op::ComputeSvSecurityData
                    | Op::VerifySvCardMac
                    | Op::CipherPin
                    | Op::GenerateCardKey
            ),
            Self::Closed => matches!(operation, Op::VerifyCardSessionMac | Op::VerifySvCardMac),
            Self::Aborted => false,
        }
    }

    /// Whether an error in this state leaves the state unchanged
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

/// Next payload expected by the digest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Request,
    Response,
}

impl Direction {
    const fn next(self) -> Self {
        match self {
            Self::Request => Self::Response,
            Self::Response => Self::Request,
        }
    }
}

#[derive(Clone)]
pub(crate) struct Challenges {
    pub(crate) card: Zeroizing<Vec<u8>>,
    pub(crate) terminal: Zeroizing<Vec<u8>>,
}

pub(crate) struct OpenSession {
    pub(crate) challenges: Challenges,
    digest: DigestAccumulator,
    codec: EncryptionCodec,
    expecting: Direction,
    /// Set once a payload has crossed the card boundary ciphered
    encrypted_updates: bool,
}

impl OpenSession {
    const fn ensure_pair_boundary(&self) -> Result<()> {
        match self.expecting {
            Direction::Request => Ok(()),
            Direction::Response => {
                Err(Error::ProtocolSequence("a card response is still expected"))
            }
        }
    }

    fn update(&mut self, payload: &[u8]) -> Result<Option<Bytes>> {
        let direction = self.expecting;

        let transformed = if self.codec.is_active() {
            let (plaintext, boundary) = match direction {
                Direction::Request => (
                    Zeroizing::new(payload.to_vec()),
                    self.codec.cipher(payload)?,
                ),
                Direction::Response => {
                    let plaintext = self.codec.decipher(payload)?;
                    (Zeroizing::new(plaintext.clone()), plaintext)
                }
            };
            self.digest.fold(PayloadMode::Ciphered, &plaintext)?;
            self.encrypted_updates = true;
            Some(Bytes::from(boundary))
        } else {
            self.digest.fold(PayloadMode::Plain, payload)?;
            None
        };

        trace!(
            ?direction,
            len = payload.len(),
            ciphered = transformed.is_some(),
            "Session payload"
        );
        self.expecting = direction.next();
        Ok(transformed)
    }
}

pub(crate) struct ClosedSession {
    expected_card_certificate: Zeroizing<Vec<u8>>,
}

impl ClosedSession {
    pub(crate) fn expected_card_certificate(&self) -> &[u8] {
        &self.expected_card_certificate
    }
}

pub(crate) enum State {
    Uninitialized,
    ContextReady(Box<Challenges>),
    DigestOpen(Box<OpenSession>),
    Closed(ClosedSession),
    Aborted,
}

impl State {
    const fn tag(&self) -> SessionState {
        match self {
            Self::Uninitialized => SessionState::Uninitialized,
            Self::ContextReady(_) => SessionState::ContextReady,
            Self::DigestOpen(_) => SessionState::DigestOpen,
            Self::Closed(_) => SessionState::Closed,
            Self::Aborted => SessionState::Aborted,
        }
    }
}

/// Terminal side of one Calypso Secure Session
///
/// The context borrows nothing from the card: the caller transports the
/// APDUs and feeds their payloads to the context in exchange order.
pub struct SessionContext<K> {
    keys: K,
    config: SessionConfig,
    rng: StdRng,
    diversifier: Option<Zeroizing<Vec<u8>>>,
    pub(crate) state: State,
    /// Expected card certificate of the last Stored Value computation
    pub(crate) sv_card_mac: Option<Zeroizing<Vec<u8>>>,
    pub(crate) card_authenticated: bool,
    pub(crate) sv_card_authenticated: bool,
}

impl<K> fmt::Debug for SessionContext<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("state", &self.state.tag())
            .field("config", &self.config)
            .field("card_authenticated", &self.card_authenticated)
            .finish_non_exhaustive()
    }
}

impl<K: KeyBackend> SessionContext<K> {
    /// Create a session reading keys from `keys`, seeded from the OS random source
    pub fn new(keys: K, config: SessionConfig) -> Self {
        Self::with_rng(keys, config, StdRng::from_os_rng())
    }

    /// Create a session with an explicit random source
    pub const fn with_rng(keys: K, config: SessionConfig, rng: StdRng) -> Self {
        Self {
            keys,
            config,
            rng,
            diversifier: None,
            state: State::Uninitialized,
            sv_card_mac: None,
            card_authenticated: false,
            sv_card_authenticated: false,
        }
    }

    /// Current state of the session
    pub const fn state(&self) -> SessionState {
        self.state.tag()
    }

    /// Session configuration
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Challenge and certificate lengths in use
    pub const fn profile(&self) -> SessionProfile {
        self.config.profile()
    }

    /// Whether session traffic is currently ciphered
    pub fn is_encryption_active(&self) -> bool {
        match &self.state {
            State::DigestOpen(open) => open.codec.is_active(),
            _ => false,
        }
    }

    /// Whether the card session certificate has been verified successfully
    pub const fn is_card_authenticated(&self) -> bool {
        self.card_authenticated
    }

    /// Whether the card Stored Value certificate has been verified successfully
    pub const fn is_sv_card_authenticated(&self) -> bool {
        self.sv_card_authenticated
    }

    /// Set the card key diversifier, usually the card serial number
    ///
    /// Allowed once, before the session context is initialized.
    pub fn set_key_diversifier(&mut self, diversifier: &[u8]) -> Result<()> {
        self.run(Operation::SetKeyDiversifier, |session| {
            if session.diversifier.is_some() {
                return Err(Error::InvalidState {
                    operation: Operation::SetKeyDiversifier,
                    state: session.state(),
                });
            }
            if diversifier.is_empty() {
                return Err(Error::InvalidInput("empty key diversifier"));
            }

            session.diversifier = Some(Zeroizing::new(diversifier.to_vec()));
            debug!(len = diversifier.len(), "Key diversifier set");
            Ok(())
        })
    }

    /// Generate the terminal challenge for the card challenge returned by Get Challenge
    ///
    /// Calling this again before the digest is opened generates a new terminal
    /// challenge and discards the previous one.
    pub fn init_terminal_secure_session_context(&mut self, card_challenge: &[u8]) -> Result<Bytes> {
        self.run(Operation::InitSessionContext, |session| {
            if session.diversifier.is_none() {
                return Err(Error::ProtocolSequence("key diversifier must be set first"));
            }
            let profile = session.profile();
            check_length(card_challenge, profile.card_challenge_len)?;

            let mut terminal = Zeroizing::new(vec![0u8; profile.terminal_challenge_len]);
            session.rng.fill_bytes(&mut terminal);
            let challenge = Bytes::copy_from_slice(&terminal);

            session.transition(State::ContextReady(Box::new(Challenges {
                card: Zeroizing::new(card_challenge.to_vec()),
                terminal,
            })));
            Ok(challenge)
        })
    }

    /// Open the session digest with the Open Secure Session response
    ///
    /// The session key is derived from the card key (kif, kvc) diversified
    /// for the current card and from both challenges.
    pub fn init_terminal_session_mac(
        &mut self,
        open_session_data_out: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<()> {
        self.run(Operation::InitSessionMac, |session| {
            let State::ContextReady(challenges) = &session.state else {
                return Err(session.wrong_state(Operation::InitSessionMac));
            };
            let challenges = Challenges::clone(challenges);
            let suite = session.profile().cipher;

            let card_key = session.card_key(kif, kvc)?;
            let keys = crypto::derive_session_keys(
                suite,
                card_key.as_bytes(),
                &challenges.terminal,
                &challenges.card,
            )?;
            let digest = DigestAccumulator::new(suite, keys.mac(), open_session_data_out)?;
            let mut codec = EncryptionCodec::new(suite, keys.enc());
            if session.config.session_encrypted {
                codec.activate();
            }

            debug!(kif, kvc, %suite, encrypted = codec.is_active(), "Session digest opened");
            session.transition(State::DigestOpen(Box::new(OpenSession {
                challenges,
                digest,
                codec,
                expecting: Direction::Request,
                encrypted_updates: false,
            })));
            Ok(())
        })
    }

    /// Open the session digest and immediately produce the early terminal certificate
    pub fn init_terminal_session_mac_with_authentication(
        &mut self,
        open_session_data_out: &[u8],
        kif: u8,
        kvc: u8,
    ) -> Result<Bytes> {
        self.init_terminal_session_mac(open_session_data_out, kif, kvc)?;
        self.generate_terminal_session_mac()
    }

    /// Fold the next command or response payload into the session digest
    ///
    /// Calls must alternate request, response, request... in exchange order.
    /// While encryption is active the payload is returned ciphered (request)
    /// or deciphered (response); otherwise `None` is returned.
    pub fn update_terminal_session_mac(&mut self, apdu: &[u8]) -> Result<Option<Bytes>> {
        self.run(Operation::UpdateSessionMac, |session| {
            session
                .open_session(Operation::UpdateSessionMac)?
                .update(apdu)
        })
    }

    /// Store plaintext (data in, data out) exchanges for a deferred digest update
    ///
    /// The exchanges are folded before the next digest operation, with the
    /// same result as passing each payload to
    /// [`update_terminal_session_mac`](Self::update_terminal_session_mac).
    pub fn prepare_digest_update<I, O>(
        &mut self,
        exchanges: impl IntoIterator<Item = (I, O)>,
    ) -> Result<()>
    where
        I: AsRef<[u8]>,
        O: AsRef<[u8]>,
    {
        self.run(Operation::PrepareDigestUpdate, |session| {
            let open = session.open_session(Operation::PrepareDigestUpdate)?;
            if open.codec.is_active() {
                return Err(Error::InvalidState {
                    operation: Operation::PrepareDigestUpdate,
                    state: SessionState::DigestOpen,
                });
            }
            open.ensure_pair_boundary()?;
            open.digest.defer_exchanges(exchanges)
        })
    }

    /// Produce the terminal certificate for an early mutual authentication
    ///
    /// Requires [`SessionConfig::early_authentication`]: without it the call
    /// fails with [`Error::ProtocolSequence`] and the session is aborted. The
    /// digest stays open. Only available before any ciphered payload.
    pub fn generate_terminal_session_mac(&mut self) -> Result<Bytes> {
        self.run(Operation::GenerateSessionMac, |session| {
            if !session.config.early_authentication {
                return Err(Error::ProtocolSequence(
                    "early mutual authentication is not enabled",
                ));
            }
            let certificate_len = session.profile().certificate_len;

            let open = session.open_session(Operation::GenerateSessionMac)?;
            if open.encrypted_updates {
                return Err(Error::ProtocolSequence(
                    "session traffic has already been ciphered",
                ));
            }
            open.ensure_pair_boundary()?;

            let digest = open.digest.snapshot()?;
            debug!("Early terminal certificate generated");
            Ok(Bytes::copy_from_slice(&digest[..certificate_len]))
        })
    }

    /// Close the session digest and produce the terminal certificate
    pub fn finalize_terminal_session_mac(&mut self) -> Result<Bytes> {
        self.run(Operation::FinalizeSessionMac, |session| {
            session
                .open_session(Operation::FinalizeSessionMac)?
                .ensure_pair_boundary()?;
            let certificate_len = session.profile().certificate_len;

            let State::DigestOpen(open) = std::mem::replace(&mut session.state, State::Aborted)
            else {
                return Err(session.wrong_state(Operation::FinalizeSessionMac));
            };
            let OpenSession { digest, .. } = *open;
            let folded = digest.folded();
            let digest = digest.finalize()?;

            let (terminal, card) = digest.split_at(certificate_len);
            let certificate = Bytes::copy_from_slice(terminal);
            let expected_card_certificate = Zeroizing::new(card[..certificate_len].to_vec());

            debug!(folded, "Session digest finalized");
            session.state = State::Closed(ClosedSession {
                expected_card_certificate,
            });
            debug!(
                from = %SessionState::DigestOpen,
                to = %SessionState::Closed,
                "Session state transition"
            );
            Ok(certificate)
        })
    }

    /// Start ciphering session traffic
    pub fn activate_encryption(&mut self) -> Result<()> {
        self.run(Operation::ActivateEncryption, |session| {
            let open = session.open_session(Operation::ActivateEncryption)?;
            open.ensure_pair_boundary()?;
            open.codec.activate();
            debug!("Session encryption activated");
            Ok(())
        })
    }

    /// Stop ciphering session traffic
    pub fn deactivate_encryption(&mut self) -> Result<()> {
        self.run(Operation::DeactivateEncryption, |session| {
            let open = session.open_session(Operation::DeactivateEncryption)?;
            open.ensure_pair_boundary()?;
            open.codec.deactivate();
            debug!("Session encryption deactivated");
            Ok(())
        })
    }

    /// Abandon the session and zeroise all retained key and digest material
    pub fn abort(&mut self) {
        if self.state() != SessionState::Aborted {
            warn!(state = %self.state(), "Secure session aborted");
            self.clear();
        }
    }

    /// Run `operation` if the current state allows it, aborting the session on error
    pub(crate) fn run<T>(
        &mut self,
        operation: Operation,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let state = self.state();
        let result = if state.allows(operation) {
            f(self)
        } else {
            Err(Error::InvalidState { operation, state })
        };

        result.inspect_err(|err| {
            if state.is_terminal() {
                debug!(%operation, %state, %err, "Operation rejected");
            } else {
                warn!(%operation, %state, %err, "Secure session aborted");
                self.clear();
            }
        })
    }

    /// Resolve key (kif, kvc) and diversify it for the current card
    pub(crate) fn card_key(&self, kif: u8, kvc: u8) -> Result<WorkKey> {
        let diversifier = self
            .diversifier
            .as_deref()
            .ok_or(Error::ProtocolSequence("key diversifier must be set first"))?;
        let suite = self.profile().cipher;
        self.keys.card_key(kif, kvc, diversifier, suite)
    }

    /// Card challenge of the current session
    pub(crate) fn card_challenge(&self, operation: Operation) -> Result<&[u8]> {
        match &self.state {
            State::ContextReady(challenges) => Ok(challenges.card.as_slice()),
            State::DigestOpen(open) => Ok(open.challenges.card.as_slice()),
            _ => Err(self.wrong_state(operation)),
        }
    }

    fn open_session(&mut self, operation: Operation) -> Result<&mut OpenSession> {
        match &mut self.state {
            State::DigestOpen(open) => Ok(&mut **open),
            state => Err(Error::InvalidState {
                operation,
                state: state.tag(),
            }),
        }
    }

    pub(crate) const fn wrong_state(&self, operation: Operation) -> Error {
        Error::InvalidState {
            operation,
            state: self.state(),
        }
    }

    fn transition(&mut self, next: State) {
        let from = self.state();
        self.state = next;
        debug!(%from, to = %self.state(), "Session state transition");
    }

    fn clear(&mut self) {
        self.state = State::Aborted;
        self.diversifier = None;
        self.sv_card_mac = None;
        self.card_authenticated = false;
        self.sv_card_authenticated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::SoftwareKeyStore;
    use crate::product::ProductType;
    use hex_literal::hex;

    const KEY: [u8; 16] = hex!("0f0e0d0c0b0a09080706050403020100");
    const DIVERSIFIER: [u8; 8] = hex!("0102030405060708");
    const CARD_CHALLENGE: [u8; 4] = hex!("aabbccdd");
    const OPEN_SESSION: [u8; 8] = hex!("030490980030791d");

    fn store() -> SoftwareKeyStore {
        SoftwareKeyStore::new().with_key(0x21, 0x79, KEY)
    }

    fn session(config: SessionConfig) -> SessionContext<SoftwareKeyStore> {
        SessionContext::with_rng(store(), config, StdRng::seed_from_u64(7))
    }

    fn open(config: SessionConfig) -> SessionContext<SoftwareKeyStore> {
        let mut session = session(config);
        session.set_key_diversifier(&DIVERSIFIER).unwrap();
        session
            .init_terminal_secure_session_context(&CARD_CHALLENGE)
            .unwrap();
        session
            .init_terminal_session_mac(&OPEN_SESSION, 0x21, 0x79)
            .unwrap();
        session
    }

    #[test]
    fn test_transition_table() {
        use Operation as Op;

        assert!(SessionState::Uninitialized.allows(Op::SetKeyDiversifier));
        assert!(!SessionState::ContextReady.allows(Op::SetKeyDiversifier));
        assert!(SessionState::ContextReady.allows(Op::InitSessionContext));
        assert!(!SessionState::DigestOpen.allows(Op::InitSessionMac));
        assert!(SessionState::Closed.allows(Op::VerifyCardSessionMac));
        assert!(!SessionState::Closed.allows(Op::ActivateEncryption));
        assert!(!SessionState::Aborted.allows(Op::VerifySvCardMac));
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::DigestOpen.is_terminal());
    }

    #[test]
    fn test_full_session() {
        let mut session = open(SessionConfig::new());
        assert_eq!(session.state(), SessionState::DigestOpen);

        assert_eq!(
            session
                .update_terminal_session_mac(&hex!("00b2014400"))
                .unwrap(),
            None
        );
        assert_eq!(
            session.update_terminal_session_mac(&hex!("9000")).unwrap(),
            None
        );

        let certificate = session.finalize_terminal_session_mac().unwrap();
        assert_eq!(certificate.len(), 4);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_deterministic_certificate() {
        let run = || {
            let mut session = open(SessionConfig::new());
            session
                .update_terminal_session_mac(&hex!("00b2014400"))
                .unwrap();
            session.update_terminal_session_mac(&hex!("9000")).unwrap();
            session.finalize_terminal_session_mac().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_diversifier_rules() {
        let mut session = session(SessionConfig::new());
        assert_eq!(
            session
                .init_terminal_secure_session_context(&CARD_CHALLENGE)
                .unwrap_err(),
            Error::ProtocolSequence("key diversifier must be set first")
        );
        assert_eq!(session.state(), SessionState::Aborted);

        let mut session = self::session(SessionConfig::new());
        session.set_key_diversifier(&DIVERSIFIER).unwrap();
        assert_eq!(
            session.set_key_diversifier(&DIVERSIFIER).unwrap_err(),
            Error::InvalidState {
                operation: Operation::SetKeyDiversifier,
                state: SessionState::Uninitialized
            }
        );

        let mut session = self::session(SessionConfig::new());
        assert_eq!(
            session.set_key_diversifier(&[]).unwrap_err(),
            Error::InvalidInput("empty key diversifier")
        );
    }

    #[test]
    fn test_card_challenge_length() {
        let mut session = session(SessionConfig::new());
        session.set_key_diversifier(&DIVERSIFIER).unwrap();
        assert_eq!(
            session
                .init_terminal_secure_session_context(&hex!("aabbccddeeff0011"))
                .unwrap_err(),
            Error::InvalidLength {
                expected: 4,
                actual: 8
            }
        );

        let mut session = self::session(
            SessionConfig::new().with_product_type(ProductType::PrimeRevision3Extended),
        );
        session.set_key_diversifier(&DIVERSIFIER).unwrap();
        let challenge = session
            .init_terminal_secure_session_context(&hex!("aabbccddeeff0011"))
            .unwrap();
        assert_eq!(challenge.len(), 8);
    }

    #[test]
    fn test_reinit_rerandomizes_challenge() {
        let mut session = session(SessionConfig::new());
        session.set_key_diversifier(&DIVERSIFIER).unwrap();
        let first = session
            .init_terminal_secure_session_context(&CARD_CHALLENGE)
            .unwrap();
        let second = session
            .init_terminal_secure_session_context(&CARD_CHALLENGE)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(session.state(), SessionState::ContextReady);
    }

    #[test]
    fn test_unknown_key_aborts() {
        let mut session = session(SessionConfig::new());
        session.set_key_diversifier(&DIVERSIFIER).unwrap();
        session
            .init_terminal_secure_session_context(&CARD_CHALLENGE)
            .unwrap();
        assert_eq!(
            session
                .init_terminal_session_mac(&OPEN_SESSION, 0x21, 0x7A)
                .unwrap_err(),
            Error::KeyNotFound {
                kif: 0x21,
                kvc: 0x7A
            }
        );
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_finalize_requires_pair_boundary() {
        let mut session = open(SessionConfig::new());
        session
            .update_terminal_session_mac(&hex!("00b2014400"))
            .unwrap();
        assert_eq!(
            session.finalize_terminal_session_mac().unwrap_err(),
            Error::ProtocolSequence("a card response is still expected")
        );
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_errors_after_close_keep_state() {
        let mut session = open(SessionConfig::new());
        session.finalize_terminal_session_mac().unwrap();

        assert_eq!(
            session
                .update_terminal_session_mac(&hex!("00b2014400"))
                .unwrap_err(),
            Error::InvalidState {
                operation: Operation::UpdateSessionMac,
                state: SessionState::Closed
            }
        );
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_encrypted_session() {
        let mut session = open(SessionConfig::new().with_session_encrypted(true));
        assert!(session.is_encryption_active());

        let ciphered = session
            .update_terminal_session_mac(&hex!("00b2014400"))
            .unwrap()
            .unwrap();
        assert_eq!(ciphered.len(), 8);

        // An empty response passes through
        let response = session.update_terminal_session_mac(&[]).unwrap();
        assert_eq!(response.as_deref(), Some(&[][..]));

        assert_eq!(
            session
                .prepare_digest_update([(hex!("00"), hex!("9000"))])
                .unwrap_err(),
            Error::InvalidState {
                operation: Operation::PrepareDigestUpdate,
                state: SessionState::DigestOpen
            }
        );
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_early_authentication() {
        let mut session = session(SessionConfig::new().with_early_authentication(true));
        session.set_key_diversifier(&DIVERSIFIER).unwrap();
        session
            .init_terminal_secure_session_context(&CARD_CHALLENGE)
            .unwrap();
        let early = session
            .init_terminal_session_mac_with_authentication(&OPEN_SESSION, 0x21, 0x79)
            .unwrap();
        assert_eq!(early.len(), 4);
        assert_eq!(session.state(), SessionState::DigestOpen);

        session.activate_encryption().unwrap();
        session
            .update_terminal_session_mac(&hex!("00b2014400"))
            .unwrap();
        session.update_terminal_session_mac(&[]).unwrap();
        assert_eq!(
            session.generate_terminal_session_mac().unwrap_err(),
            Error::ProtocolSequence("session traffic has already been ciphered")
        );
    }

    #[test]
    fn test_early_authentication_disabled() {
        let mut session = open(SessionConfig::new());
        assert_eq!(
            session.generate_terminal_session_mac().unwrap_err(),
            Error::ProtocolSequence("early mutual authentication is not enabled")
        );
    }

    #[test]
    fn test_abort() {
        let mut session = open(SessionConfig::new());
        session.abort();
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(matches!(
            session.update_terminal_session_mac(&hex!("00")),
            Err(Error::InvalidState {
                state: SessionState::Aborted,
                ..
            })
        ));
        assert_eq!(session.state(), SessionState::Aborted);
    }

    #[test]
    fn test_debug_reports_state() {
        let session = open(SessionConfig::new());
        let debug = format!("{session:?}");
        assert!(debug.starts_with("SessionContext"));
        assert!(debug.contains("state: DigestOpen"));
    }

    #[test]
    fn test_oversized_deferred_exchange_aborts() {
        let mut session = open(SessionConfig::new());
        let oversized = vec![0u8; 0x10000];
        assert_eq!(
            session
                .prepare_digest_update([(hex!("00b2014400").to_vec(), oversized)])
                .unwrap_err(),
            Error::InvalidInput("payload longer than 65535 bytes")
        );
        assert_eq!(session.state(), SessionState::Aborted);
    }
}
