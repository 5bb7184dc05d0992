//! UDS client: builds requests, tracks the one outstanding request through
//! its send/await/timeout cycle and validates responses
//!
//! The client is initiator-driven: a request API call (see the builders in
//! this module's `impl`, e.g. [UdsClient::send_diag_sess_ctrl]) moves the
//! state machine out of `Idle`, and [UdsClient::poll] drives it back. Events
//! ([ClientEvent]) are delivered to a [ClientEventHandler].

mod request;

pub use request::{RoutineControlResponse, SecurityAccessResponse, unpack_rdbi_response,
    unpack_request_download_response, unpack_routine_control_response,
    unpack_security_access_response};

use bitflags::bitflags;
use log::{debug, warn};

use crate::channel::{Mtype, SduInfo, TargetAddressType, TpStatus, Transport};
use crate::clock::{SharedClock, time_after};
use crate::error::{ClientError, ClientResult, Nrc};
use crate::{ServiceId, UDS_TP_MTU, response_sid_of};

bitflags! {
    /// Per-request behavior flags. The active set is snapshotted when a
    /// request is issued.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ClientOptions: u8 {
        /// Set bit 0x80 of the sub-function: the server sends no positive
        /// response
        const SUPPRESS_POS_RESP = 0x01;
        /// Send functionally addressed (single frame, no response awaited)
        const FUNCTIONAL = 0x02;
        /// Deliver negative responses as [ClientEvent::Err] instead of
        /// [ClientEvent::ResponseReceived]
        const NEG_RESP_IS_ERR = 0x04;
        /// Do not adopt the P2/P2* values advertised in a
        /// DiagnosticSessionControl response
        const IGNORE_SRV_TIMINGS = 0x08;
    }
}

/// Client request state
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, strum_macros::Display)]
pub enum ClientState {
    /// No request outstanding; the only state accepting a new request
    #[default]
    Idle,
    /// Handing the request to the transport
    Sending,
    /// Transport accepted the request, transmission may still be in flight
    AwaitSendComplete,
    /// Waiting for the server's response within P2 (or P2* after a 0x78)
    AwaitResponse,
}

/// Events delivered to the client's event handler
#[derive(Debug)]
pub enum ClientEvent<'a> {
    /// Emitted on every [UdsClient::poll] call, useful for sequencing
    Poll,
    /// The request left the transport completely
    SendComplete,
    /// A validated response arrived. Negative responses land here too
    /// unless [ClientOptions::NEG_RESP_IS_ERR] is set.
    ResponseReceived {
        /// Full response bytes, starting with the response SID (or 0x7F)
        response: &'a [u8],
    },
    /// The request failed; the client returns to idle
    Err {
        /// What went wrong
        error: ClientError,
    },
    /// The client became idle and will accept a new request
    Idle,
}

/// User callback receiving [ClientEvent]s
pub trait ClientEventHandler {
    /// Handles one event. Payloads are valid only for the duration of the
    /// call.
    fn on_event(&mut self, ev: ClientEvent<'_>);
}

/// Client timing configuration (ISO14229-2 2013 Table 5 defaults)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClientConfig {
    /// P2_client: budget for the start of a response, milliseconds
    pub p2_ms: u16,
    /// Extended budget applying after an NRC 0x78, milliseconds
    pub p2_star_ms: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            p2_ms: 150,
            p2_star_ms: 1500,
        }
    }
}

/// ISO14229 diagnostic client bound to one transport endpoint
pub struct UdsClient<T: Transport, H: ClientEventHandler> {
    tp: T,
    handler: H,
    clock: SharedClock,

    p2_ms: u16,
    p2_star_ms: u32,
    p2_timer: u32,

    state: ClientState,
    /// Live option set, applied to the next request
    pub options: ClientOptions,
    options_snapshot: ClientOptions,

    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
    last_error: Option<ClientError>,
}

impl<T: Transport, H: ClientEventHandler> std::fmt::Debug for UdsClient<T, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsClient")
            .field("state", &self.state)
            .field("options", &self.options)
            .field("p2_ms", &self.p2_ms)
            .field("p2_star_ms", &self.p2_star_ms)
            .finish_non_exhaustive()
    }
}

impl<T: Transport, H: ClientEventHandler> UdsClient<T, H> {
    /// Creates an idle client
    pub fn new(tp: T, handler: H, cfg: ClientConfig, clock: SharedClock) -> Self {
        let p2_star_ms = if cfg.p2_star_ms < u32::from(cfg.p2_ms) {
            warn!("p2_star_ms must be >= p2_ms, clamping");
            u32::from(cfg.p2_ms)
        } else {
            cfg.p2_star_ms
        };
        Self {
            tp,
            handler,
            clock,
            p2_ms: cfg.p2_ms,
            p2_star_ms,
            p2_timer: 0,
            state: ClientState::Idle,
            options: ClientOptions::empty(),
            options_snapshot: ClientOptions::empty(),
            send_buf: Vec::with_capacity(UDS_TP_MTU),
            recv_buf: Vec::with_capacity(UDS_TP_MTU),
            last_error: None,
        }
    }

    /// Current request state
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Error that ended the most recent request, if any
    pub fn last_error(&self) -> Option<&ClientError> {
        self.last_error.as_ref()
    }

    /// Currently effective P2 budget in milliseconds (may have been adopted
    /// from a DiagnosticSessionControl response)
    pub fn p2_ms(&self) -> u16 {
        self.p2_ms
    }

    /// Currently effective P2* budget in milliseconds
    pub fn p2_star_ms(&self) -> u32 {
        self.p2_star_ms
    }

    /// Access to the event handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Access to the transport endpoint
    pub fn tp_mut(&mut self) -> &mut T {
        &mut self.tp
    }

    /// Runs one cooperative scheduling step
    pub fn poll(&mut self) {
        self.handler.on_event(ClientEvent::Poll);
        self.poll_low_level();
    }

    /// Issues a raw request already laid out as UDS bytes. The per-service
    /// builders wrap this.
    pub(crate) fn send_request(&mut self, bytes: &[u8]) -> ClientResult<()> {
        if self.state != ClientState::Idle {
            return Err(ClientError::Busy);
        }
        if bytes.is_empty() || bytes.len() > UDS_TP_MTU {
            return Err(ClientError::BufferTooSmall);
        }
        self.last_error = None;
        self.recv_buf.clear();
        self.send_buf.clear();
        self.send_buf.extend_from_slice(bytes);

        self.options_snapshot = self.options;
        if self.options_snapshot.contains(ClientOptions::SUPPRESS_POS_RESP)
            && self.send_buf.len() >= 2
        {
            // UDS-1:2013 8.2.2 Table 11
            self.send_buf[1] |= 0x80;
        }

        self.set_state(ClientState::Sending);
        // poll once so transmission begins immediately
        self.poll_low_level();
        Ok(())
    }

    fn set_state(&mut self, state: ClientState) {
        if state != self.state {
            debug!("client state: {} -> {}", self.state, state);
            self.state = state;
            if state == ClientState::Idle {
                self.handler.on_event(ClientEvent::Idle);
            }
        }
    }

    fn fail(&mut self, error: ClientError) {
        warn!("client request failed: {error}");
        self.last_error = Some(error.clone());
        self.handler.on_event(ClientEvent::Err { error });
        self.set_state(ClientState::Idle);
    }

    fn poll_low_level(&mut self) {
        let tp_status = self.tp.poll();
        let now = self.clock.millis();
        match self.state {
            ClientState::Idle => {}
            ClientState::Sending => self.continue_sending(),
            ClientState::AwaitSendComplete => self.await_send_complete(tp_status, now),
            ClientState::AwaitResponse => self.await_response(now),
        }
    }

    fn continue_sending(&mut self) {
        let ta_type = if self.options_snapshot.contains(ClientOptions::FUNCTIONAL) {
            TargetAddressType::Functional
        } else {
            TargetAddressType::Physical
        };
        let info = SduInfo {
            mtype: Mtype::Diagnostic,
            ta_type,
            ..Default::default()
        };
        match self.tp.send(&self.send_buf, &info) {
            Err(e) => self.fail(ClientError::Transport(e)),
            Ok(0) => {} // transport will take it on a later poll
            Ok(n) if n == self.send_buf.len() => self.set_state(ClientState::AwaitSendComplete),
            Ok(_) => self.fail(ClientError::BufferTooSmall),
        }
    }

    fn await_send_complete(&mut self, tp_status: TpStatus, now: u32) {
        if self.options_snapshot.contains(ClientOptions::FUNCTIONAL) {
            // functional requests are single frame and draw responses from
            // many servers; there is nothing to await
            self.handler.on_event(ClientEvent::SendComplete);
            self.set_state(ClientState::Idle);
            return;
        }
        if tp_status.contains(TpStatus::SEND_IN_PROGRESS) {
            return;
        }
        self.handler.on_event(ClientEvent::SendComplete);
        if self.options_snapshot.contains(ClientOptions::SUPPRESS_POS_RESP) {
            self.set_state(ClientState::Idle);
        } else {
            self.p2_timer = now.wrapping_add(u32::from(self.p2_ms));
            self.set_state(ClientState::AwaitResponse);
        }
    }

    fn await_response(&mut self, now: u32) {
        let received = {
            let Self { tp, recv_buf, .. } = &mut *self;
            recv_buf.resize(UDS_TP_MTU, 0);
            tp.recv(recv_buf)
        };
        match received {
            Err(e) => {
                self.recv_buf.clear();
                self.fail(ClientError::Transport(e));
            }
            Ok(None) => {
                self.recv_buf.clear();
                if time_after(now, self.p2_timer) {
                    self.fail(ClientError::Timeout);
                }
            }
            Ok(Some((len, info))) => {
                self.recv_buf.truncate(len);
                if info.ta_type == TargetAddressType::Functional {
                    // responses to our physical request cannot arrive
                    // functionally addressed
                    debug!("client: ignoring functionally addressed SDU while awaiting response");
                    self.recv_buf.clear();
                    return;
                }
                self.process_response(now);
            }
        }
    }

    fn process_response(&mut self, now: u32) {
        match self.validate_response() {
            Err(e) => self.fail(e),
            Ok(true) => {
                // NRC 0x78: the server bought itself P2* more time
                debug!("client: got RCRRP, extending p2 timer");
                self.p2_timer = now.wrapping_add(self.p2_star_ms);
                self.recv_buf.clear();
            }
            Ok(false) => {
                self.adopt_session_timings();
                let Self {
                    handler, recv_buf, ..
                } = self;
                handler.on_event(ClientEvent::ResponseReceived { response: recv_buf });
                self.set_state(ClientState::Idle);
            }
        }
    }

    /// Checks the response against the outstanding request. `Ok(true)`
    /// means RCRRP: keep waiting.
    fn validate_response(&self) -> Result<bool, ClientError> {
        let resp = &self.recv_buf;
        if resp.is_empty() {
            return Err(ClientError::ResponseTooShort);
        }

        if resp[0] == 0x7F {
            if resp.len() < 3 {
                return Err(ClientError::ResponseTooShort);
            }
            if resp[1] != self.send_buf[0] {
                return Err(ClientError::SidMismatch);
            }
            if resp[2] == u8::from(Nrc::RequestCorrectlyReceivedResponsePending) {
                return Ok(true);
            }
            if self
                .options_snapshot
                .contains(ClientOptions::NEG_RESP_IS_ERR)
            {
                return Err(ClientError::NegativeResponse(Nrc::from(resp[2])));
            }
            return Ok(false);
        }

        if resp[0] != response_sid_of(self.send_buf[0]) {
            return Err(ClientError::SidMismatch);
        }
        if self.send_buf[0] == ServiceId::EcuReset as u8 && self.send_buf.len() >= 2 {
            if resp.len() < 2 {
                return Err(ClientError::ResponseTooShort);
            }
            if resp[1] != self.send_buf[1] {
                return Err(ClientError::SubFunctionMismatch);
            }
        }
        if self.send_buf[0] == ServiceId::DiagnosticSessionControl as u8 && resp.len() < 6 {
            return Err(ClientError::ResponseTooShort);
        }
        Ok(false)
    }

    /// A DiagnosticSessionControl positive response advertises the server's
    /// timing capabilities; adopt them unless told not to
    fn adopt_session_timings(&mut self) {
        if self.recv_buf[0] != response_sid_of(ServiceId::DiagnosticSessionControl as u8) {
            return;
        }
        if self
            .options_snapshot
            .contains(ClientOptions::IGNORE_SRV_TIMINGS)
        {
            return;
        }
        let p2 = (u16::from(self.recv_buf[2]) << 8) | u16::from(self.recv_buf[3]);
        let p2_star =
            ((u32::from(self.recv_buf[4]) << 8) | u32::from(self.recv_buf[5])) * 10;
        debug!("client: adopting server timings p2={p2}ms p2*={p2_star}ms");
        self.p2_ms = p2;
        self.p2_star_ms = p2_star;
    }
}
