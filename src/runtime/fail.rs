// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Error taxonomy for the IPv4 engine.
//!
//! Failures are not syscall-shaped, so instead of piggy-backing on an errno
//! value, every condition the engine can hit is enumerated, grouped by the
//! stage that raises it. Every leaf type converts into the top-level
//! [`Error`] with `?`/`From`, so call sites just propagate with `?` and
//! match on the flattened enum wherever one is needed.

use ::std::fmt;

/// Validator-stage failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidateError {
    NotReceiveBuffer,
    NoIpHeader,
    WrongProtocolHdrType,
    InvalidVersion,
    InvalidHdrLen,
    InvalidTotLen,
    InvalidDataLen,
    InvalidChkSum,
    InvalidFlag,
    InvalidFrag,
    InvalidProtocol,
    InvalidAddrSrc,
    InvalidAddrDest,
    InvalidAddrBroadcast,
}

/// IPv4 option-decoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionError {
    InvalidOpt,
    InvalidOptLen,
    InvalidOptNbr,
    InvalidOptEnd,
    InvalidOptFlag,
    InvalidOptType,
    InvalidOptCfg,
    InvalidOptRoute,
    OptBufNoneAvail,
    OptBufLen,
    OptBufWr,
}

/// Fragment-reassembly outcomes. Several of these are not errors in the
/// usual sense — `FragNone`/`FragReasm`/`FragComplete` are carrier variants
/// describing where a buffer ended up, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragError {
    FragNone,
    FragReasm,
    FragComplete,
    FragDiscard,
    FragOffset,
    FragSize,
    FragSizeTot,
    FragLenTot,
}

/// Transmit-preparation outcomes. As with [`FragError`], the `TxDest*`
/// variants are route-selection carriers, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    TxDestInvalid,
    TxDestLocalHost,
    TxDestBroadcast,
    TxDestMulticast,
    TxDestHostThisNet,
    TxDestDfltGateway,
    InvalidProtocol,
    InvalidDataLen,
    InvalidTos,
    InvalidFlag,
    InvalidTtl,
    InvalidAddrSrc,
    InvalidAddrDest,
    InvalidFrag,
    InvalidOptLen,
    InvalidOptCfg,
}

/// Address-table configuration failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrCfgError {
    AddrCfgState,
    AddrTblFull,
    AddrTblEmpty,
    AddrNotFound,
    AddrCfgInProgress,
    AddrCfgInUse,
    InvalidAddrHost,
    InvalidAddrGateway,
}

/// Top-level error, flattening every stage's taxonomy into one enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Validate(ValidateError),
    Option(OptionError),
    Frag(FragError),
    Tx(TxError),
    AddrCfg(AddrCfgError),
}

impl From<ValidateError> for Error {
    fn from(e: ValidateError) -> Self {
        Error::Validate(e)
    }
}

impl From<OptionError> for Error {
    fn from(e: OptionError) -> Self {
        Error::Option(e)
    }
}

impl From<FragError> for Error {
    fn from(e: FragError) -> Self {
        Error::Frag(e)
    }
}

impl From<TxError> for Error {
    fn from(e: TxError) -> Self {
        Error::Tx(e)
    }
}

impl From<AddrCfgError> for Error {
    fn from(e: AddrCfgError) -> Self {
        Error::AddrCfg(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}
