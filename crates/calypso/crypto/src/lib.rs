//! Terminal-side cryptographic engine for Calypso Secure Sessions
//!
//! This crate computes everything a terminal needs to secure a Calypso card
//! transaction: the terminal challenge, the session keys, the running
//! session digest and terminal certificate, the ciphering of session
//! traffic, the verification of card certificates, and the auxiliary
//! security data of Stored Value, PIN and key loading commands.
//!
//! It performs no I/O. The caller transports the APDUs and feeds their
//! payloads to a [`SessionContext`], which reads its keys from a
//! [`KeyBackend`] such as the in-memory [`SoftwareKeyStore`].
//!
//! Regular Calypso products use two-key Triple-DES with 4-byte challenges
//! and certificates; Prime revision 3 products in extended mode use AES-128
//! with 8-byte challenges and certificates.

#![forbid(unsafe_code)]

pub mod certificate;
pub mod codec;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod key_transport;
pub mod keys;
pub mod product;
pub mod session;
pub mod sv;

pub use codec::EncryptionCodec;
pub use config::SessionConfig;
pub use digest::{DigestAccumulator, PayloadMode};
pub use error::{Error, Result};
pub use keys::{KeyBackend, KeyReference, SoftwareKeyStore, WorkKey};
pub use product::{CipherSuite, ProductType, SessionProfile};
pub use session::{Operation, SessionContext, SessionState};
pub use sv::{SvAction, SvCommandSecurityData, SvOperation, SvSecurityData};
