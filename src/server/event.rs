//! Events delivered to the server's service handler
//!
//! Each UDS service the server decodes becomes one [ServerEvent] variant
//! carrying the parsed request fields. Where a service produces response
//! data, the variant carries a [ResponseWriter] that appends into the
//! server's send buffer; where the handler may override a default (session
//! timings, power-down time, transfer block length) the variant carries a
//! `&mut` field.
//!
//! Event payloads borrow the server's buffers and are only valid for the
//! duration of the callback.

use crate::error::{Nrc, TransportError};

/// Returned by a [ServiceHandler]: `Ok(())` produces a positive response,
/// `Err(nrc)` a negative one. Returning
/// [Nrc::RequestCorrectlyReceivedResponsePending] makes the server emit a
/// `7F .. 78` response now and re-invoke the handler with the same event on
/// each subsequent poll until it returns something else.
pub type ServiceResult = Result<(), Nrc>;

/// User callback receiving decoded service requests and lifecycle events
pub trait ServiceHandler {
    /// Handles one event. See [ServerEvent] for the per-variant contracts.
    fn handle(&mut self, ev: ServerEvent<'_>) -> ServiceResult;
}

/// Appends response payload bytes into the server's send buffer.
///
/// The writer enforces the transport MTU: overflowing appends fail with
/// [Nrc::ResponseTooLong] and leave the buffer untouched.
#[derive(Debug)]
pub struct ResponseWriter<'a> {
    buf: &'a mut Vec<u8>,
    cap: usize,
}

impl<'a> ResponseWriter<'a> {
    pub(crate) fn new(buf: &'a mut Vec<u8>, cap: usize) -> Self {
        Self { buf, cap }
    }

    /// Appends `bytes` to the response
    pub fn put(&mut self, bytes: &[u8]) -> ServiceResult {
        if self.buf.len() + bytes.len() > self.cap {
            return Err(Nrc::ResponseTooLong);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Appends one byte
    pub fn put_u8(&mut self, b: u8) -> ServiceResult {
        self.put(&[b])
    }

    /// Appends a big-endian u16
    pub fn put_u16(&mut self, v: u16) -> ServiceResult {
        self.put(&v.to_be_bytes())
    }

    /// Bytes currently in the response, including the header the server
    /// wrote before invoking the handler
    pub fn written(&self) -> usize {
        self.buf.len()
    }

    /// Free space remaining before the MTU is hit
    pub fn remaining(&self) -> usize {
        self.cap - self.buf.len()
    }
}

/// Session timing advertisement, mutable by the 0x10 handler
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionTimings {
    /// P2_server_max in milliseconds (1 ms resolution on the wire)
    pub p2_ms: u16,
    /// Enhanced P2 (after NRC 0x78) in milliseconds (10 ms resolution on
    /// the wire)
    pub p2_star_ms: u32,
}

/// 0x19 report type, one variant per ISO14229-1 sub-function family
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum DtcReport {
    /// 0x01
    NumberOfDtcByStatusMask { mask: u8 },
    /// 0x02
    DtcByStatusMask { mask: u8 },
    /// 0x03
    DtcSnapshotIdentification,
    /// 0x04
    DtcSnapshotRecordByDtcNumber { dtc: u32, record: u8 },
    /// 0x05
    DtcStoredDataByRecordNumber { record: u8 },
    /// 0x06
    DtcExtDataRecordByDtcNumber { dtc: u32, record: u8 },
    /// 0x07
    NumberOfDtcBySeverityMask { severity_mask: u8, status_mask: u8 },
    /// 0x08
    DtcBySeverityMask { severity_mask: u8, status_mask: u8 },
    /// 0x09
    SeverityInformationOfDtc { dtc: u32 },
    /// 0x0A
    SupportedDtc,
    /// 0x0B
    FirstTestFailedDtc,
    /// 0x0C
    FirstConfirmedDtc,
    /// 0x0D
    MostRecentTestFailedDtc,
    /// 0x0E
    MostRecentConfirmedDtc,
    /// 0x14
    DtcFaultDetectionCounter,
    /// 0x15
    DtcWithPermanentStatus,
    /// 0x16
    DtcExtDataRecordByRecordNumber { record: u8 },
    /// 0x17
    UserDefMemoryDtcByStatusMask { mask: u8, memory: u8 },
    /// 0x18
    UserDefMemoryDtcSnapshotRecordByDtcNumber { dtc: u32, record: u8, memory: u8 },
    /// 0x19
    UserDefMemoryDtcExtDataRecordByDtcNumber { dtc: u32, record: u8, memory: u8 },
    /// 0x1A
    DtcExtendedDataRecordIdentification { record: u8 },
    /// 0x42
    WwhObdDtcByMaskRecord { functional_group: u8, status_mask: u8, severity_mask: u8 },
    /// 0x55
    WwhObdDtcWithPermanentStatus { functional_group: u8 },
    /// 0x56
    DtcInformationByDtcReadinessGroup { functional_group: u8, readiness_group: u8 },
}

/// 0x29 Authentication operation (ISO14229-1:2020)
#[derive(Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AuthOp<'a> {
    /// 0x00
    DeAuthenticate,
    /// 0x01
    VerifyCertificateUnidirectional {
        comm_config: u8,
        certificate: &'a [u8],
        challenge: &'a [u8],
    },
    /// 0x02
    VerifyCertificateBidirectional {
        comm_config: u8,
        certificate: &'a [u8],
        challenge: &'a [u8],
    },
    /// 0x03
    ProofOfOwnership {
        proof: &'a [u8],
        ephemeral_public_key: &'a [u8],
    },
    /// 0x04
    TransmitCertificate { evaluation_id: u8, certificate: &'a [u8] },
    /// 0x05
    RequestChallengeForAuthentication { comm_config: u8, algorithm: &'a [u8] },
    /// 0x06
    VerifyProofOfOwnershipUnidirectional {
        algorithm: &'a [u8],
        proof: &'a [u8],
        challenge: &'a [u8],
        additional: &'a [u8],
    },
    /// 0x07
    VerifyProofOfOwnershipBidirectional {
        algorithm: &'a [u8],
        proof: &'a [u8],
        challenge: &'a [u8],
        additional: &'a [u8],
    },
    /// 0x08
    AuthenticationConfiguration,
}

/// Authentication returnParameter values (ISO14229-1:2020 Table B.5),
/// written back through the `auth_state` field of [ServerEvent::Auth]
pub mod auth_state {
    /// Request accepted
    pub const REQUEST_ACCEPTED: u8 = 0x00;
    /// General reject
    pub const GENERAL_REJECT: u8 = 0x01;
    /// Authentication configuration: APCE
    pub const CONFIGURATION_APCE: u8 = 0x02;
    /// Authentication configuration: ACR with asymmetric cryptography
    pub const CONFIGURATION_ACR_ASYMMETRIC: u8 = 0x03;
    /// Authentication configuration: ACR with symmetric cryptography
    pub const CONFIGURATION_ACR_SYMMETRIC: u8 = 0x04;
    /// De-authentication successful
    pub const DEAUTHENTICATION_SUCCESSFUL: u8 = 0x10;
    /// Certificate verified, ownership verification necessary
    pub const CERTIFICATE_VERIFIED_OWNERSHIP_NECESSARY: u8 = 0x11;
    /// Ownership verified, authentication complete
    pub const OWNERSHIP_VERIFIED: u8 = 0x12;
    /// Certificate verified
    pub const CERTIFICATE_VERIFIED: u8 = 0x13;
}

/// 0x2C DynamicallyDefineDataIdentifier operation
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DynamicDefineOp {
    /// 0x01 defineByIdentifier - one event per source entry
    ById {
        /// dynamicallyDefinedDataIdentifier
        dynamic_did: u16,
        /// Source data identifier
        source_did: u16,
        /// Position in the source record (1-based)
        position: u8,
        /// Number of bytes
        size: u8,
    },
    /// 0x02 defineByMemoryAddress - one event per address/length pair
    ByMemoryAddress {
        /// dynamicallyDefinedDataIdentifier
        dynamic_did: u16,
        /// Decoded memory address
        address: usize,
        /// Decoded memory size
        size: usize,
    },
    /// 0x03 clearDynamicallyDefinedDataIdentifier; `None` clears all
    Clear {
        /// Identifier to clear, or `None` for all
        dynamic_did: Option<u16>,
    },
}

/// 0x38 RequestFileTransfer modeOfOperation (ISO14229-1:2020 Table G.1)
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum FileOperation {
    AddFile = 1,
    DeleteFile = 2,
    ReplaceFile = 3,
    ReadFile = 4,
    ReadDir = 5,
    ResumeFile = 6,
}

/// Decoded request (or lifecycle notification) delivered to the
/// [ServiceHandler]
#[derive(Debug)]
pub enum ServerEvent<'a> {
    /// 0x10 DiagnosticSessionControl. `timings` is pre-filled with the
    /// server's configured P2/P2* and echoed in the positive response.
    DiagSessCtrl {
        /// Requested session type (suppress bit stripped)
        session_type: u8,
        /// Advertised timing values, mutable
        timings: &'a mut SessionTimings,
    },
    /// 0x11 ECUReset. On a positive return the server stops accepting
    /// requests and emits [ServerEvent::DoScheduledReset] once
    /// `power_down_time_ms` elapses.
    EcuReset {
        /// Requested reset type
        reset_type: u8,
        /// Delay before the scheduled reset fires, mutable
        power_down_time_ms: &'a mut u32,
    },
    /// 0x14 ClearDiagnosticInformation
    ClearDiagnosticInfo {
        /// groupOfDTC (lower 3 bytes)
        group_of_dtc: u32,
        /// Optional memorySelection byte
        memory_selection: Option<u8>,
    },
    /// 0x19 ReadDTCInformation
    ReadDtcInformation {
        /// Decoded report request
        report: DtcReport,
        /// Appends the report data after the echoed sub-function
        writer: ResponseWriter<'a>,
    },
    /// 0x22 ReadDataByIdentifier, once per requested DID. A positive return
    /// with no bytes written is turned into NRC 0x10 by the server.
    ReadDataByIdent {
        /// Requested data identifier
        did: u16,
        /// Appends the data record after the echoed DID
        writer: ResponseWriter<'a>,
    },
    /// 0x23 ReadMemoryByAddress. The handler must write exactly `size`
    /// bytes.
    ReadMemByAddr {
        /// Decoded memory address
        address: usize,
        /// Decoded memory size
        size: usize,
        /// Appends the memory record
        writer: ResponseWriter<'a>,
    },
    /// 0x28 CommunicationControl
    CommCtrl {
        /// controlType (suppress bit stripped)
        control_type: u8,
        /// communicationType
        communication_type: u8,
        /// nodeIdentificationNumber, present for controlType 0x04/0x05
        node_id: Option<u16>,
    },
    /// 0x27 SecurityAccess, odd sub-function: provide a seed via the writer
    SecAccessRequestSeed {
        /// Requested security level (the odd sub-function value)
        level: u8,
        /// securityAccessDataRecord sent by the client
        record: &'a [u8],
        /// Appends the seed
        writer: ResponseWriter<'a>,
    },
    /// 0x27 SecurityAccess, even sub-function: validate the client's key.
    /// A negative return arms the brute-force lockout timer.
    SecAccessValidateKey {
        /// Security level being unlocked (the matching odd value)
        level: u8,
        /// Key bytes sent by the client
        key: &'a [u8],
    },
    /// 0x29 Authentication
    Auth {
        /// Decoded operation
        op: AuthOp<'a>,
        /// authenticationReturnParameter (Table B.5), echoed at byte 2 of
        /// the response; see [auth_state]
        auth_state: &'a mut u8,
        /// Appends sub-function specific response data
        writer: ResponseWriter<'a>,
    },
    /// 0x2C DynamicallyDefineDataIdentifier, once per entry
    DynamicDefineDataId {
        /// Decoded operation
        op: DynamicDefineOp,
    },
    /// 0x2E WriteDataByIdentifier
    WriteDataByIdent {
        /// Data identifier to write
        did: u16,
        /// Data record
        data: &'a [u8],
    },
    /// 0x2F InputOutputControlByIdentifier
    IoControl {
        /// Data identifier
        did: u16,
        /// inputOutputControlParameter
        control_param: u8,
        /// controlState bytes and controlMask
        state_and_mask: &'a [u8],
        /// Appends the controlStatus record
        writer: ResponseWriter<'a>,
    },
    /// 0x31 RoutineControl
    RoutineCtrl {
        /// routineControlType (1 = start, 2 = stop, 3 = request results)
        control_type: u8,
        /// routineIdentifier
        routine_id: u16,
        /// routineControlOptionRecord
        record: &'a [u8],
        /// Appends the routineStatusRecord
        writer: ResponseWriter<'a>,
    },
    /// 0x34 RequestDownload. `max_block_len` is pre-filled with the
    /// configured default and must stay >= 3.
    RequestDownload {
        /// Decoded memory address
        address: usize,
        /// Decoded download size in bytes
        size: usize,
        /// dataFormatIdentifier
        data_format: u8,
        /// maxNumberOfBlockLength echoed to the client, mutable
        max_block_len: &'a mut u16,
    },
    /// 0x35 RequestUpload
    RequestUpload {
        /// Decoded memory address
        address: usize,
        /// Decoded upload size in bytes
        size: usize,
        /// dataFormatIdentifier
        data_format: u8,
        /// maxNumberOfBlockLength echoed to the client, mutable
        max_block_len: &'a mut u16,
    },
    /// 0x36 TransferData
    TransferData {
        /// transferRequestParameterRecord (the block payload)
        data: &'a [u8],
        /// Do not write more response bytes than this
        max_resp_len: u16,
        /// Appends transferResponseParameterRecord data
        writer: ResponseWriter<'a>,
    },
    /// 0x37 RequestTransferExit. A positive return clears the transfer
    /// state.
    RequestTransferExit {
        /// transferRequestParameterRecord
        data: &'a [u8],
        /// Appends transferResponseParameterRecord data
        writer: ResponseWriter<'a>,
    },
    /// 0x38 RequestFileTransfer
    RequestFileTransfer {
        /// modeOfOperation
        mode: FileOperation,
        /// filePathAndName bytes
        file_path: &'a [u8],
        /// dataFormatIdentifier (absent modes report 0)
        data_format: u8,
        /// fileSizeUncompressed (absent modes report 0)
        file_size_uncompressed: usize,
        /// fileSizeCompressed (absent modes report 0)
        file_size_compressed: usize,
        /// maxNumberOfBlockLength echoed to the client, mutable
        max_block_len: &'a mut u16,
    },
    /// 0x3D WriteMemoryByAddress
    WriteMemByAddr {
        /// Decoded memory address
        address: usize,
        /// Decoded memory size
        size: usize,
        /// Data record; its length equals `size`
        data: &'a [u8],
    },
    /// 0x85 ControlDTCSetting
    ControlDtcSetting {
        /// dtcSettingType (suppress bit stripped)
        setting_type: u8,
        /// DTCSettingControlOptionRecord
        record: &'a [u8],
    },
    /// 0x87 LinkControl
    LinkControl {
        /// Sub-function (suppress bit stripped)
        control_type: u8,
        /// Sub-function specific data
        record: &'a [u8],
    },
    /// A SID with no built-in handler (0x24, 0x2A, 0x83, 0x84, 0x86 and
    /// anything unknown). The positive response SID is pre-written;
    /// returning [Nrc::ServiceNotSupported] rejects the request.
    Custom {
        /// Raw request SID
        sid: u8,
        /// Request bytes after the SID
        record: &'a [u8],
        /// Appends response data after the echoed SID
        writer: ResponseWriter<'a>,
    },
    /// The S3 timer expired: the server has reverted to the default session
    /// and relocked security access
    SessionTimeout,
    /// The session left a non-default state for the default one; any
    /// elevated access is gone
    AuthTimeout,
    /// The power-down time after a positive ECUReset response elapsed; the
    /// user performs the actual reset
    DoScheduledReset {
        /// Reset type from the originating request
        reset_type: u8,
    },
    /// The server failed to transmit a response
    Err {
        /// Underlying transport failure
        error: TransportError,
    },
}
