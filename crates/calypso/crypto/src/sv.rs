//! Stored Value command security data
//!
//! SV Reload, SV Debit and SV Undebit commands carry their own security
//! data, computed from the SV Get exchange that precedes them and from the
//! SV key of the operation. The computation never touches the session
//! digest.

use bytes::{BufMut, Bytes, BytesMut};
use derive_more::Display;
use tracing::debug;
use zeroize::Zeroizing;

use crate::constants::{ins, kif, sv, tag};
use crate::keys::KeyBackend;
use crate::session::{Operation, SessionContext};
use crate::{Error, Result, crypto};

/// Stored Value operation
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SvOperation {
    /// Increase the SV balance
    #[display("SV Reload")]
    Reload,
    /// Decrease the SV balance
    #[display("SV Debit")]
    Debit,
    /// Cancel a previous debit
    #[display("SV Undebit")]
    Undebit,
}

impl SvOperation {
    /// Instruction byte of the SV command
    pub const fn instruction(self) -> u8 {
        match self {
            Self::Reload => ins::SV_RELOAD,
            Self::Debit => ins::SV_DEBIT,
            Self::Undebit => ins::SV_UNDEBIT,
        }
    }

    /// Key identifier of the SV key used for this operation
    pub const fn kif(self) -> u8 {
        match self {
            Self::Reload => kif::LOAD,
            Self::Debit | Self::Undebit => kif::DEBIT,
        }
    }

    /// Expected length of the SV Get response data
    pub const fn sv_get_data_len(self) -> usize {
        match self {
            Self::Reload => sv::GET_DATA_RELOAD_LEN,
            Self::Debit | Self::Undebit => sv::GET_DATA_DEBIT_LEN,
        }
    }

    /// Expected length of the partial SV command
    pub const fn command_data_len(self) -> usize {
        match self {
            Self::Reload => sv::RELOAD_DATA_LEN,
            Self::Debit | Self::Undebit => sv::DEBIT_DATA_LEN,
        }
    }
}

/// Whether an SV operation is performed or cancelled
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SvAction {
    /// Perform the operation
    #[default]
    #[display("do")]
    Do,
    /// Cancel the operation
    #[display("undo")]
    Undo,
}

impl SvAction {
    const fn code(self) -> u8 {
        match self {
            Self::Do => 0x00,
            Self::Undo => 0x01,
        }
    }
}

/// Security data computed for one SV command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvSecurityData {
    /// Terminal serial number
    pub serial_number: Bytes,
    /// SV transaction number
    pub transaction_number: Bytes,
    /// Terminal SV challenge
    pub terminal_challenge: Bytes,
    /// Terminal SV certificate
    pub terminal_sv_mac: Bytes,
}

impl SvSecurityData {
    /// Data appended to the SV command: serial number, transaction number,
    /// terminal challenge and terminal SV MAC
    pub fn complementary_data(&self) -> Bytes {
        let mut data = BytesMut::with_capacity(
            self.serial_number.len()
                + self.transaction_number.len()
                + self.terminal_challenge.len()
                + self.terminal_sv_mac.len(),
        );
        data.put_slice(&self.serial_number);
        data.put_slice(&self.transaction_number);
        data.put_slice(&self.terminal_challenge);
        data.put_slice(&self.terminal_sv_mac);
        data.freeze()
    }
}

/// Inputs and outputs of an SV command security computation
///
/// The inputs are the SV Get command header, the SV Get response data and
/// the partial SV command (header and data, without security data). The
/// outputs are filled once by
/// [`SessionContext::compute_sv_security_data`].
#[derive(Debug, Clone)]
pub struct SvCommandSecurityData {
    operation: SvOperation,
    action: SvAction,
    sv_get_header: Bytes,
    sv_get_data: Bytes,
    sv_command_data: Bytes,
    computed: Option<SvSecurityData>,
}

impl SvCommandSecurityData {
    /// Collect the inputs of an SV command security computation
    pub fn new(
        operation: SvOperation,
        action: SvAction,
        sv_get_header: impl Into<Bytes>,
        sv_get_data: impl Into<Bytes>,
        sv_command_data: impl Into<Bytes>,
    ) -> Self {
        Self {
            operation,
            action,
            sv_get_header: sv_get_header.into(),
            sv_get_data: sv_get_data.into(),
            sv_command_data: sv_command_data.into(),
            computed: None,
        }
    }

    /// SV operation
    pub const fn operation(&self) -> SvOperation {
        self.operation
    }

    /// SV action
    pub const fn action(&self) -> SvAction {
        self.action
    }

    /// Computed security data, if any
    pub const fn security_data(&self) -> Option<&SvSecurityData> {
        self.computed.as_ref()
    }

    /// Terminal serial number, once computed
    pub fn serial_number(&self) -> Option<&Bytes> {
        self.computed.as_ref().map(|data| &data.serial_number)
    }

    /// SV transaction number, once computed
    pub fn transaction_number(&self) -> Option<&Bytes> {
        self.computed.as_ref().map(|data| &data.transaction_number)
    }

    /// Terminal SV challenge, once computed
    pub fn terminal_challenge(&self) -> Option<&Bytes> {
        self.computed.as_ref().map(|data| &data.terminal_challenge)
    }

    /// Terminal SV certificate, once computed
    pub fn terminal_sv_mac(&self) -> Option<&Bytes> {
        self.computed.as_ref().map(|data| &data.terminal_sv_mac)
    }

    /// SV complementary data, once computed
    pub fn sv_complementary_data(&self) -> Option<Bytes> {
        self.computed
            .as_ref()
            .map(SvSecurityData::complementary_data)
    }

    fn validate(&self) -> Result<()> {
        if self.computed.is_some() {
            return Err(Error::InvalidInput("SV security data already computed"));
        }
        if self.sv_get_header.len() != sv::GET_HEADER_LEN
            || self.sv_get_header[sv::INS_OFFSET] != ins::SV_GET
        {
            return Err(Error::InvalidInput("invalid SV Get command header"));
        }
        if self.sv_get_data.len() != self.operation.sv_get_data_len() {
            return Err(Error::InvalidInput("invalid SV Get response length"));
        }
        if self.sv_command_data.len() != self.operation.command_data_len()
            || self.sv_command_data[sv::INS_OFFSET] != self.operation.instruction()
        {
            return Err(Error::InvalidInput(
                "SV command does not match the SV operation",
            ));
        }
        Ok(())
    }

    /// KVC of the SV key, as reported by SV Get
    fn kvc(&self) -> u8 {
        self.sv_get_data[sv::KVC_OFFSET]
    }
}

impl<K: KeyBackend> SessionContext<K> {
    /// Compute the security data of an SV Reload, Debit or Undebit command
    ///
    /// The SV key is selected by the operation KIF and the KVC reported by
    /// SV Get, then diversified for the current card. The expected card SV
    /// certificate is kept for [`verify_sv_card_mac`](Self::verify_sv_card_mac).
    pub fn compute_sv_security_data(&mut self, data: &mut SvCommandSecurityData) -> Result<()> {
        self.run(Operation::ComputeSvSecurityData, |session| {
            data.validate()?;

            let profile = session.profile();
            let suite = profile.cipher;
            let (kif, kvc) = (data.operation.kif(), data.kvc());
            let key = session.card_key(kif, kvc)?;

            let numbers = crypto::compute_mac(
                suite,
                key.as_bytes(),
                &[
                    &[tag::SV_NUMBERS],
                    &data.sv_get_header[..],
                    &data.sv_get_data[..],
                ],
            )?;
            let (transaction_number, rest) = numbers.split_at(sv::TRANSACTION_NUMBER_LEN);
            let terminal_challenge = &rest[..sv::TERMINAL_CHALLENGE_LEN];
            let serial_number = session.config().terminal_serial_number;

            let terminal_mac = crypto::compute_mac(
                suite,
                key.as_bytes(),
                &[
                    &[
                        tag::SV_TERMINAL,
                        data.operation.instruction(),
                        data.action.code(),
                    ],
                    &data.sv_get_header[..],
                    &data.sv_get_data[..],
                    &data.sv_command_data[..],
                    &serial_number,
                    transaction_number,
                    terminal_challenge,
                ],
            )?;
            let terminal_sv_mac = &terminal_mac[..profile.terminal_sv_mac_len];

            let card_mac = crypto::compute_mac(
                suite,
                key.as_bytes(),
                &[&[tag::SV_CARD], terminal_sv_mac, transaction_number],
            )?;

            let expected = Zeroizing::new(card_mac[..profile.card_sv_mac_len].to_vec());
            session.sv_card_mac = Some(expected);
            session.sv_card_authenticated = false;
            data.computed = Some(SvSecurityData {
                serial_number: Bytes::copy_from_slice(&serial_number),
                transaction_number: Bytes::copy_from_slice(transaction_number),
                terminal_challenge: Bytes::copy_from_slice(terminal_challenge),
                terminal_sv_mac: Bytes::copy_from_slice(terminal_sv_mac),
            });

            debug!(
                operation = %data.operation,
                action = %data.action,
                kif,
                kvc,
                "SV security data computed"
            );
            Ok(())
        })
    }

    /// Check the card SV certificate returned by the SV command
    ///
    /// Compared in constant time with the value predicted by the last
    /// [`compute_sv_security_data`](Self::compute_sv_security_data).
    pub fn verify_sv_card_mac(&mut self, card_sv_mac: &[u8]) -> Result<bool> {
        self.run(Operation::VerifySvCardMac, |session| {
            let expected = session
                .sv_card_mac
                .as_ref()
                .ok_or(Error::ProtocolSequence(
                    "no SV security data has been computed",
                ))?;

            let verified = crypto::ct_eq(expected, card_sv_mac);
            session.sv_card_authenticated |= verified;
            debug!(verified, "Card SV certificate checked");
            Ok(verified)
        })
    }

    /// Alias of [`verify_sv_card_mac`](Self::verify_sv_card_mac)
    pub fn verify_sv_card_certificate(&mut self, card_sv_mac: &[u8]) -> Result<bool> {
        self.verify_sv_card_mac(card_sv_mac)
    }
}
