//! UDS server: request dispatch, session/security/transfer state and the
//! cooperative poll loop
//!
//! The server owns a [Transport] endpoint and a [ServiceHandler]. Each call
//! to [UdsServer::poll] fires due timers (scheduled ECU reset, pending
//! NRC 0x78 re-invocation, S3 session timeout) and then drains at most one
//! request SDU from the transport, dispatches it and transmits the
//! response.

mod event;
mod handlers;

pub use event::{
    AuthOp, DtcReport, DynamicDefineOp, FileOperation, ResponseWriter, ServerEvent, ServiceHandler,
    ServiceResult, SessionTimings, auth_state,
};

use log::{debug, warn};

use crate::channel::{SduInfo, TargetAddressType, Transport};
use crate::clock::{SharedClock, time_after};
use crate::error::Nrc;
use crate::{ServiceId, UDS_TP_MTU, response_sid_of};

/// defaultSession (ISO14229-1 Table 25)
pub const SESSION_DEFAULT: u8 = 0x01;
/// programmingSession
pub const SESSION_PROGRAMMING: u8 = 0x02;
/// extendedDiagnosticSession
pub const SESSION_EXTENDED: u8 = 0x03;
/// safetySystemDiagnosticSession
pub const SESSION_SAFETY_SYSTEM: u8 = 0x04;

/// ECUReset sub-function: enableRapidPowerShutDown
pub const RESET_ENABLE_RAPID_POWER_SHUTDOWN: u8 = 0x04;

/// Server timing and policy configuration.
///
/// Defaults follow ISO14229-2 2013 Tables 4 and 5 and the common
/// brute-force mitigation values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    /// P2_server_max: budget for the first response, milliseconds
    pub p2_ms: u16,
    /// Enhanced P2 applying after an NRC 0x78, milliseconds
    pub p2_star_ms: u32,
    /// S3: non-default session idle timeout, milliseconds
    pub s3_ms: u32,
    /// Delay between a positive ECUReset response and the
    /// [ServerEvent::DoScheduledReset] emission, milliseconds
    pub power_down_time_ms: u32,
    /// 0x27 requests are rejected with NRC 0x37 until this long after boot
    pub sec_access_boot_delay_ms: u32,
    /// 0x27 requests are rejected with NRC 0x36 for this long after a
    /// failed key validation
    pub sec_access_auth_fail_delay_ms: u32,
    /// Default maxNumberOfBlockLength advertised by 0x34/0x35/0x38
    pub xfer_max_block_length: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            p2_ms: 50,
            p2_star_ms: 5000,
            s3_ms: 5100,
            power_down_time_ms: 60,
            sec_access_boot_delay_ms: 1000,
            sec_access_auth_fail_delay_ms: 1000,
            xfer_max_block_length: UDS_TP_MTU as u16,
        }
    }
}

/// SIDs carrying a sub-function whose bit 0x80 suppresses the positive
/// response (UDS-1:2013 7.5.5)
const SUBFUNCTIONED_SIDS: [u8; 8] = [0x10, 0x11, 0x27, 0x28, 0x31, 0x3E, 0x85, 0x87];

/// NRCs suppressed entirely on functionally addressed requests
/// (UDS-1:2013 7.5.5)
fn functional_suppressed_nrc(nrc: Nrc) -> bool {
    matches!(
        nrc,
        Nrc::ServiceNotSupported
            | Nrc::SubFunctionNotSupported
            | Nrc::ServiceNotSupportedInActiveSession
            | Nrc::SubFunctionNotSupportedInActiveSession
            | Nrc::RequestOutOfRange
    )
}

/// ISO14229 diagnostic server bound to one transport endpoint.
///
/// One active dialog per endpoint: a reply to request N is emitted before
/// request N+1 is accepted.
pub struct UdsServer<T: Transport, H: ServiceHandler> {
    tp: T,
    handler: H,
    clock: SharedClock,
    cfg: ServerConfig,

    session_type: u8,
    security_level: u8,

    s3_timer: u32,
    p2_timer: u32,
    ecu_reset_timer: u32,
    sec_access_boot_delay_timer: u32,
    sec_access_auth_fail_timer: u32,

    /// Nonzero = reset type awaiting post-response execution
    ecu_reset_scheduled: u8,
    not_ready_to_receive: bool,
    /// A 0x78 was emitted and the handler will be re-invoked
    rcrrp_pending: bool,
    /// A 0x78 was emitted for the current request (disables positive
    /// response suppression)
    rcrrp_sent: bool,

    xfer_active: bool,
    xfer_block_seq_counter: u8,
    xfer_total_bytes: usize,
    xfer_byte_counter: usize,
    xfer_block_length: u16,

    recv_buf: Vec<u8>,
    recv_info: SduInfo,
    send_buf: Vec<u8>,
}

impl<T: Transport, H: ServiceHandler> std::fmt::Debug for UdsServer<T, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsServer")
            .field("session_type", &self.session_type)
            .field("security_level", &self.security_level)
            .field("xfer_active", &self.xfer_active)
            .field("rcrrp_pending", &self.rcrrp_pending)
            .finish_non_exhaustive()
    }
}

impl<T: Transport, H: ServiceHandler> UdsServer<T, H> {
    /// Creates a server in the default session. The security-access boot
    /// delay starts counting from this call.
    pub fn new(tp: T, handler: H, cfg: ServerConfig, clock: SharedClock) -> Self {
        let now = clock.millis();
        Self {
            tp,
            handler,
            cfg,
            session_type: SESSION_DEFAULT,
            security_level: 0,
            s3_timer: now.wrapping_add(cfg.s3_ms),
            p2_timer: now,
            ecu_reset_timer: now,
            sec_access_boot_delay_timer: now.wrapping_add(cfg.sec_access_boot_delay_ms),
            sec_access_auth_fail_timer: now,
            ecu_reset_scheduled: 0,
            not_ready_to_receive: false,
            rcrrp_pending: false,
            rcrrp_sent: false,
            xfer_active: false,
            xfer_block_seq_counter: 1,
            xfer_total_bytes: 0,
            xfer_byte_counter: 0,
            xfer_block_length: 0,
            recv_buf: Vec::with_capacity(UDS_TP_MTU),
            recv_info: SduInfo::default(),
            send_buf: Vec::with_capacity(UDS_TP_MTU),
            clock,
        }
    }

    /// Active diagnostic session type
    pub fn session_type(&self) -> u8 {
        self.session_type
    }

    /// Unlocked security level; 0 = locked
    pub fn security_level(&self) -> u8 {
        self.security_level
    }

    /// True while an 0x34/0x35/0x38 transfer is open
    pub fn transfer_active(&self) -> bool {
        self.xfer_active
    }

    /// Access to the service handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Access to the transport endpoint
    pub fn tp_mut(&mut self) -> &mut T {
        &mut self.tp
    }

    /// Runs one cooperative scheduling step. Call this from the host loop
    /// with a tick no coarser than the tightest timer in use.
    pub fn poll(&mut self) {
        let now = self.clock.millis();

        if self.ecu_reset_scheduled != 0 && time_after(now, self.ecu_reset_timer) {
            let reset_type = self.ecu_reset_scheduled;
            self.ecu_reset_scheduled = 0;
            debug!("server: emitting scheduled reset, type 0x{reset_type:02X}");
            let _ = self.handler.handle(ServerEvent::DoScheduledReset { reset_type });
        }

        if self.rcrrp_pending && time_after(now, self.p2_timer) {
            self.continue_pending_request(now);
        }

        if self.session_type != SESSION_DEFAULT && time_after(now, self.s3_timer) {
            debug!("server: S3 session timeout");
            let _ = self.handler.handle(ServerEvent::SessionTimeout);
            self.session_type = SESSION_DEFAULT;
            self.security_level = 0;
        }

        self.tp.poll();
        if self.not_ready_to_receive {
            return;
        }

        let received = {
            let Self { tp, recv_buf, .. } = &mut *self;
            recv_buf.resize(UDS_TP_MTU, 0);
            tp.recv(recv_buf)
        };
        match received {
            Ok(Some((len, info))) => {
                self.recv_buf.truncate(len);
                self.recv_info = info;
                if len == 0 {
                    debug!("server: dropping empty SDU");
                    return;
                }
                self.process_request(now);
            }
            Ok(None) => self.recv_buf.clear(),
            Err(e) => {
                self.recv_buf.clear();
                warn!("server: transport receive error: {e}");
            }
        }
    }

    /// Runs the dispatcher on the request held in `recv_buf`
    fn process_request(&mut self, now: u32) {
        self.rcrrp_sent = false;
        let result = self.evaluate_service_response();
        if result == Err(Nrc::RequestCorrectlyReceivedResponsePending) {
            // the stored request is re-evaluated on each p2 expiry until the
            // handler produces a terminal result
            self.rcrrp_pending = true;
            self.rcrrp_sent = true;
            self.not_ready_to_receive = true;
            self.p2_timer = now.wrapping_add(self.cfg.p2_star_ms * 3 / 10);
            self.send_response();
        } else {
            self.send_response();
            self.not_ready_to_receive = self.ecu_reset_scheduled != 0;
        }
    }

    fn continue_pending_request(&mut self, now: u32) {
        let result = self.evaluate_service_response();
        if result == Err(Nrc::RequestCorrectlyReceivedResponsePending) {
            self.p2_timer = now.wrapping_add(self.cfg.p2_star_ms * 3 / 10);
            self.send_response();
        } else {
            self.rcrrp_pending = false;
            self.rcrrp_sent = false;
            self.send_response();
            self.not_ready_to_receive = self.ecu_reset_scheduled != 0;
        }
    }

    /// Calls the service for the SID in `recv_buf`, applying the response
    /// suppression rules of UDS-1:2013 7.5.5. On return, `send_buf` holds
    /// the bytes to transmit (possibly none).
    fn evaluate_service_response(&mut self) -> ServiceResult {
        let sid = self.recv_buf[0];
        self.send_buf.clear();

        let result = self.call_service(sid);

        let subfunction = self.recv_buf.get(1).copied().unwrap_or(0);
        let mut suppress = false;

        if SUBFUNCTIONED_SIDS.contains(&sid)
            && result.is_ok()
            && subfunction & 0x80 != 0
            && !self.rcrrp_sent
        {
            suppress = true;
        }

        match result {
            Err(nrc) => {
                self.send_buf.clear();
                self.send_buf
                    .extend_from_slice(&[0x7F, sid, u8::from(nrc)]);
                if self.recv_info.ta_type == TargetAddressType::Functional
                    && functional_suppressed_nrc(nrc)
                    && !self.rcrrp_sent
                {
                    suppress = true;
                }
            }
            Ok(()) => {}
        }

        if suppress {
            self.send_buf.clear();
        }
        result
    }

    fn call_service(&mut self, sid: u8) -> ServiceResult {
        use ServiceId::*;
        match ServiceId::from_repr(sid) {
            Some(DiagnosticSessionControl) => self.handle_diagnostic_session_control(),
            Some(EcuReset) => self.handle_ecu_reset(),
            Some(ClearDiagnosticInformation) => self.handle_clear_diagnostic_information(),
            Some(ReadDtcInformation) => self.handle_read_dtc_information(),
            Some(ReadDataByIdentifier) => self.handle_read_data_by_identifier(),
            Some(ReadMemoryByAddress) => self.handle_read_memory_by_address(),
            Some(SecurityAccess) => self.handle_security_access(),
            Some(CommunicationControl) => self.handle_communication_control(),
            Some(Authentication) => self.handle_authentication(),
            Some(DynamicallyDefineDataIdentifier) => self.handle_dynamically_define_data_id(),
            Some(WriteDataByIdentifier) => self.handle_write_data_by_identifier(),
            Some(IoControlByIdentifier) => self.handle_io_control(),
            Some(RoutineControl) => self.handle_routine_control(),
            Some(RequestDownload) => self.handle_request_download(),
            Some(RequestUpload) => self.handle_request_upload(),
            Some(TransferData) => self.handle_transfer_data(),
            Some(RequestTransferExit) => self.handle_request_transfer_exit(),
            Some(RequestFileTransfer) => self.handle_request_file_transfer(),
            Some(WriteMemoryByAddress) => self.handle_write_memory_by_address(),
            Some(TesterPresent) => self.handle_tester_present(),
            Some(ControlDtcSetting) => self.handle_control_dtc_setting(),
            Some(LinkControl) => self.handle_link_control(),
            // services with no built-in decoder and unknown SIDs go to the
            // user's Custom hook
            Some(
                ReadScalingDataByIdentifier
                | ReadDataByPeriodicIdentifier
                | AccessTimingParameter
                | SecuredDataTransmission
                | ResponseOnEvent,
            )
            | None => self.handle_custom(sid),
        }
    }

    fn handle_custom(&mut self, sid: u8) -> ServiceResult {
        self.send_buf.push(response_sid_of(sid));
        let Self {
            handler,
            recv_buf,
            send_buf,
            ..
        } = self;
        handler.handle(ServerEvent::Custom {
            sid,
            record: &recv_buf[1..],
            writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
        })
    }

    fn send_response(&mut self) {
        if self.send_buf.is_empty() {
            return;
        }
        let info = SduInfo {
            mtype: self.recv_info.mtype,
            source: self.recv_info.target,
            target: self.recv_info.source,
            ta_type: TargetAddressType::Physical,
        };
        if let Err(e) = self.tp.send(&self.send_buf, &info) {
            warn!("server: response transmit failed: {e}");
            let _ = self.handler.handle(ServerEvent::Err { error: e });
        }
    }

    // ------------------------------------------------------------------
    // helpers shared with the handlers module

    fn now(&self) -> u32 {
        self.clock.millis()
    }

    fn refresh_s3(&mut self) {
        self.s3_timer = self.now().wrapping_add(self.cfg.s3_ms);
    }

    fn reset_transfer(&mut self) {
        self.xfer_active = false;
        self.xfer_block_seq_counter = 1;
        self.xfer_total_bytes = 0;
        self.xfer_byte_counter = 0;
    }
}
