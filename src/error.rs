//! Error vocabulary shared by the server, client and transport layers

use thiserror::Error;

/// UDS Negative response codes as defined in ISO14229-1:2020 Table A.1.
///
/// A service handler reports failure by returning one of these; the server
/// encodes it as the third byte of a `7F` negative response. The client maps
/// the byte back through [`Nrc::from`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum Nrc {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrInvalidFormat,
    ResponseTooLong,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    NoResponseFromSubnetComponent,
    FailurePreventsExecutionOfRequestedAction,
    RequestOutOfRange,
    SecurityAccessDenied,
    AuthenticationRequired,
    InvalidKey,
    ExceedNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    SecureDataTransmissionRequired,
    SecureDataTransmissionNotAllowed,
    SecureDataVerificationFailed,
    CertificateVerificationFailedInvalidTimePeriod,
    CertificateVerificationFailedInvalidSignature,
    CertificateVerificationFailedInvalidChainOfTrust,
    CertificateVerificationFailedInvalidType,
    CertificateVerificationFailedInvalidFormat,
    CertificateVerificationFailedInvalidContent,
    CertificateVerificationFailedInvalidScope,
    CertificateVerificationFailedInvalidCertificate,
    OwnershipVerificationFailed,
    ChallengeCalculationFailed,
    SettingAccessRightsFailed,
    SessionKeyCreationOrDerivationFailed,
    ConfigurationDataUsageFailed,
    DeAuthenticationFailed,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    RequestCorrectlyReceivedResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    RpmTooHigh,
    RpmTooLow,
    EngineIsRunning,
    EngineIsNotRunning,
    EngineRunTimeTooLow,
    TemperatureTooHigh,
    TemperatureTooLow,
    VehicleSpeedTooHigh,
    VehicleSpeedTooLow,
    ThrottlePedalTooHigh,
    ThrottlePedalTooLow,
    TransmissionRangeNotInNeutral,
    TransmissionRangeNotInGear,
    BrakeSwitchNotClosed,
    ShifterLeverNotInPark,
    TorqueConverterClutchLocked,
    VoltageTooHigh,
    VoltageTooLow,
    ResourceTemporarilyNotAvailable,
    /// Any code the tables above reserve, carrying the raw byte
    IsoSaeReserved(u8),
}

impl From<u8> for Nrc {
    fn from(b: u8) -> Self {
        match b {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x14 => Self::ResponseTooLong,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x25 => Self::NoResponseFromSubnetComponent,
            0x26 => Self::FailurePreventsExecutionOfRequestedAction,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x34 => Self::AuthenticationRequired,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceedNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x38 => Self::SecureDataTransmissionRequired,
            0x39 => Self::SecureDataTransmissionNotAllowed,
            0x3A => Self::SecureDataVerificationFailed,
            0x50 => Self::CertificateVerificationFailedInvalidTimePeriod,
            0x51 => Self::CertificateVerificationFailedInvalidSignature,
            0x52 => Self::CertificateVerificationFailedInvalidChainOfTrust,
            0x53 => Self::CertificateVerificationFailedInvalidType,
            0x54 => Self::CertificateVerificationFailedInvalidFormat,
            0x55 => Self::CertificateVerificationFailedInvalidContent,
            0x56 => Self::CertificateVerificationFailedInvalidScope,
            0x57 => Self::CertificateVerificationFailedInvalidCertificate,
            0x58 => Self::OwnershipVerificationFailed,
            0x59 => Self::ChallengeCalculationFailed,
            0x5A => Self::SettingAccessRightsFailed,
            0x5B => Self::SessionKeyCreationOrDerivationFailed,
            0x5C => Self::ConfigurationDataUsageFailed,
            0x5D => Self::DeAuthenticationFailed,
            0x70 => Self::UploadDownloadNotAccepted,
            0x71 => Self::TransferDataSuspended,
            0x72 => Self::GeneralProgrammingFailure,
            0x73 => Self::WrongBlockSequenceCounter,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            0x81 => Self::RpmTooHigh,
            0x82 => Self::RpmTooLow,
            0x83 => Self::EngineIsRunning,
            0x84 => Self::EngineIsNotRunning,
            0x85 => Self::EngineRunTimeTooLow,
            0x86 => Self::TemperatureTooHigh,
            0x87 => Self::TemperatureTooLow,
            0x88 => Self::VehicleSpeedTooHigh,
            0x89 => Self::VehicleSpeedTooLow,
            0x8A => Self::ThrottlePedalTooHigh,
            0x8B => Self::ThrottlePedalTooLow,
            0x8C => Self::TransmissionRangeNotInNeutral,
            0x8D => Self::TransmissionRangeNotInGear,
            0x8F => Self::BrakeSwitchNotClosed,
            0x90 => Self::ShifterLeverNotInPark,
            0x91 => Self::TorqueConverterClutchLocked,
            0x92 => Self::VoltageTooHigh,
            0x93 => Self::VoltageTooLow,
            0x94 => Self::ResourceTemporarilyNotAvailable,
            x => Self::IsoSaeReserved(x),
        }
    }
}

impl From<Nrc> for u8 {
    fn from(nrc: Nrc) -> u8 {
        match nrc {
            Nrc::GeneralReject => 0x10,
            Nrc::ServiceNotSupported => 0x11,
            Nrc::SubFunctionNotSupported => 0x12,
            Nrc::IncorrectMessageLengthOrInvalidFormat => 0x13,
            Nrc::ResponseTooLong => 0x14,
            Nrc::BusyRepeatRequest => 0x21,
            Nrc::ConditionsNotCorrect => 0x22,
            Nrc::RequestSequenceError => 0x24,
            Nrc::NoResponseFromSubnetComponent => 0x25,
            Nrc::FailurePreventsExecutionOfRequestedAction => 0x26,
            Nrc::RequestOutOfRange => 0x31,
            Nrc::SecurityAccessDenied => 0x33,
            Nrc::AuthenticationRequired => 0x34,
            Nrc::InvalidKey => 0x35,
            Nrc::ExceedNumberOfAttempts => 0x36,
            Nrc::RequiredTimeDelayNotExpired => 0x37,
            Nrc::SecureDataTransmissionRequired => 0x38,
            Nrc::SecureDataTransmissionNotAllowed => 0x39,
            Nrc::SecureDataVerificationFailed => 0x3A,
            Nrc::CertificateVerificationFailedInvalidTimePeriod => 0x50,
            Nrc::CertificateVerificationFailedInvalidSignature => 0x51,
            Nrc::CertificateVerificationFailedInvalidChainOfTrust => 0x52,
            Nrc::CertificateVerificationFailedInvalidType => 0x53,
            Nrc::CertificateVerificationFailedInvalidFormat => 0x54,
            Nrc::CertificateVerificationFailedInvalidContent => 0x55,
            Nrc::CertificateVerificationFailedInvalidScope => 0x56,
            Nrc::CertificateVerificationFailedInvalidCertificate => 0x57,
            Nrc::OwnershipVerificationFailed => 0x58,
            Nrc::ChallengeCalculationFailed => 0x59,
            Nrc::SettingAccessRightsFailed => 0x5A,
            Nrc::SessionKeyCreationOrDerivationFailed => 0x5B,
            Nrc::ConfigurationDataUsageFailed => 0x5C,
            Nrc::DeAuthenticationFailed => 0x5D,
            Nrc::UploadDownloadNotAccepted => 0x70,
            Nrc::TransferDataSuspended => 0x71,
            Nrc::GeneralProgrammingFailure => 0x72,
            Nrc::WrongBlockSequenceCounter => 0x73,
            Nrc::RequestCorrectlyReceivedResponsePending => 0x78,
            Nrc::SubFunctionNotSupportedInActiveSession => 0x7E,
            Nrc::ServiceNotSupportedInActiveSession => 0x7F,
            Nrc::RpmTooHigh => 0x81,
            Nrc::RpmTooLow => 0x82,
            Nrc::EngineIsRunning => 0x83,
            Nrc::EngineIsNotRunning => 0x84,
            Nrc::EngineRunTimeTooLow => 0x85,
            Nrc::TemperatureTooHigh => 0x86,
            Nrc::TemperatureTooLow => 0x87,
            Nrc::VehicleSpeedTooHigh => 0x88,
            Nrc::VehicleSpeedTooLow => 0x89,
            Nrc::ThrottlePedalTooHigh => 0x8A,
            Nrc::ThrottlePedalTooLow => 0x8B,
            Nrc::TransmissionRangeNotInNeutral => 0x8C,
            Nrc::TransmissionRangeNotInGear => 0x8D,
            Nrc::BrakeSwitchNotClosed => 0x8F,
            Nrc::ShifterLeverNotInPark => 0x90,
            Nrc::TorqueConverterClutchLocked => 0x91,
            Nrc::VoltageTooHigh => 0x92,
            Nrc::VoltageTooLow => 0x93,
            Nrc::ResourceTemporarilyNotAvailable => 0x94,
            Nrc::IsoSaeReserved(x) => x,
        }
    }
}

impl std::fmt::Display for Nrc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, u8::from(*self))
    }
}

/// Error produced by a [crate::channel::Transport] implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The SDU does not fit in the transport's buffers (or exceeds the
    /// ISO-TP MTU of 4095 bytes)
    #[error("payload of {0} bytes does not fit transport buffer")]
    PayloadTooLarge(usize),
    /// A functionally addressed SDU exceeded the link's single-frame capacity
    #[error("functional SDU of {0} bytes does not fit in a single frame")]
    FunctionalSduTooLarge(usize),
    /// This transport has no functional address configured
    #[error("no functional address configured")]
    NoFunctionalAddress,
    /// The transport is mid-transmission and cannot accept another SDU
    #[error("transport busy")]
    Busy,
    /// A protocol error on the underlying link (timer expiry, bad sequence
    /// number, flow control abort)
    #[error("link layer error: {0}")]
    Link(&'static str),
    /// Error reported by the frame-level driver underneath the transport
    #[error("hardware error: {0}")]
    Hardware(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors surfaced by the [crate::client::UdsClient]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// No response arrived within P2 (or P2* after an NRC 0x78)
    #[error("request timed out")]
    Timeout,
    /// The response SID does not match the outstanding request
    #[error("response SID does not match request")]
    SidMismatch,
    /// The echoed subfunction does not match the request
    #[error("response subfunction does not match request")]
    SubFunctionMismatch,
    /// The response DID does not match the request DID
    #[error("response data identifier does not match request")]
    DidMismatch,
    /// The response is shorter than the service's minimum response length
    #[error("response too short")]
    ResponseTooShort,
    /// The server answered with a negative response and the
    /// `NEG_RESP_IS_ERR` option is set
    #[error("server responded with NRC {0}")]
    NegativeResponse(Nrc),
    /// Underlying transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// A request payload does not fit in the client's send buffer
    #[error("buffer too small")]
    BufferTooSmall,
    /// A request argument is outside its valid range
    #[error("invalid argument")]
    InvalidArg,
    /// A request was issued while another is outstanding
    #[error("client busy")]
    Busy,
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
