#![warn(missing_docs)]
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]

//! A crate implementing the core of a UDS (ISO14229-1) diagnostic stack:
//! a server that answers diagnostic requests, a client that issues them,
//! and the ISO15765-2 (ISO-TP) segmentation layer that carries service data
//! units over a frame-oriented link such as classic CAN.
//!
//! ## Architecture
//!
//! * [channel] defines the [channel::Transport] boundary: anything that can
//!   move one already-segmented SDU. Implementations provided here are the
//!   software segmenter ([isotp::IsoTpTransport]) and an in-memory mock
//!   network ([sim::SimNetwork]) for tests and bench setups.
//! * [server::UdsServer] dispatches incoming requests to per-SID handlers,
//!   surfaces them to user code as [server::ServerEvent]s and manages
//!   session, security-access and data-transfer state.
//! * [client::UdsClient] tracks one outstanding request through its
//!   send/await/timeout cycle governed by P2/P2* timing.
//!
//! Everything is single-threaded and cooperative: the host owns the loop and
//! calls `poll()` on the server and/or client with a tick no coarser than the
//! tightest timer (1ms is a sensible value). Time comes from an injected
//! [clock::Clock] so that tests can run on a virtual timebase.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use uds_stack::clock::SimClock;
//! use uds_stack::server::{ServerConfig, ServerEvent, ServiceHandler, ServiceResult, UdsServer};
//! use uds_stack::sim::SimNetwork;
//!
//! struct Ecu;
//! impl ServiceHandler for Ecu {
//!     fn handle(&mut self, ev: ServerEvent<'_>) -> ServiceResult {
//!         match ev {
//!             ServerEvent::ReadDataByIdent { did: 0xF190, mut writer } => {
//!                 writer.put(b"W0L0000043MB541326")
//!             }
//!             _ => Ok(()),
//!         }
//!     }
//! }
//!
//! let clock = Arc::new(SimClock::new());
//! let net = SimNetwork::new(clock.clone());
//! let tp = net.endpoint(0x7E8, 0x7E0, Some((0x7DF, 0x7DF)));
//! let mut server = UdsServer::new(tp, Ecu, ServerConfig::default(), clock);
//! server.poll();
//! ```

pub mod channel;
pub mod client;
pub mod clock;
pub mod error;
pub mod isotp;
pub mod server;
pub mod sim;

pub use error::{ClientError, Nrc, TransportError};

/// Maximum ISO-TP service data unit size (ISO15765-2 2004 section 5.3.3)
pub const UDS_TP_MTU: usize = 4095;

/// Computes the positive response SID for a request SID
pub const fn response_sid_of(request_sid: u8) -> u8 {
    request_sid.wrapping_add(0x40)
}

/// Computes the request SID a positive response SID belongs to
pub const fn request_sid_of(response_sid: u8) -> u8 {
    response_sid.wrapping_sub(0x40)
}

/// UDS Service identifiers known to this stack (ISO14229-1 Table 23)
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::FromRepr)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum ServiceId {
    DiagnosticSessionControl = 0x10,
    EcuReset = 0x11,
    ClearDiagnosticInformation = 0x14,
    ReadDtcInformation = 0x19,
    ReadDataByIdentifier = 0x22,
    ReadMemoryByAddress = 0x23,
    ReadScalingDataByIdentifier = 0x24,
    SecurityAccess = 0x27,
    CommunicationControl = 0x28,
    Authentication = 0x29,
    ReadDataByPeriodicIdentifier = 0x2A,
    DynamicallyDefineDataIdentifier = 0x2C,
    WriteDataByIdentifier = 0x2E,
    IoControlByIdentifier = 0x2F,
    RoutineControl = 0x31,
    RequestDownload = 0x34,
    RequestUpload = 0x35,
    TransferData = 0x36,
    RequestTransferExit = 0x37,
    RequestFileTransfer = 0x38,
    WriteMemoryByAddress = 0x3D,
    TesterPresent = 0x3E,
    AccessTimingParameter = 0x83,
    SecuredDataTransmission = 0x84,
    ControlDtcSetting = 0x85,
    ResponseOnEvent = 0x86,
    LinkControl = 0x87,
}
