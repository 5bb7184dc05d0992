//! Per-SID service handlers
//!
//! Each handler validates the request held in the server's receive buffer,
//! decodes the canonical arguments, surfaces them to the user's
//! [ServiceHandler] and encodes the fixed-format positive response into the
//! send buffer. Byte layouts follow ISO14229-1:2013 (with the 2020
//! additions for 0x29).

use log::{error, warn};

use super::event::{
    AuthOp, DtcReport, DynamicDefineOp, FileOperation, ResponseWriter, ServerEvent, ServiceHandler,
    ServiceResult, SessionTimings, auth_state,
};
use super::{RESET_ENABLE_RAPID_POWER_SHUTDOWN, SESSION_DEFAULT, UdsServer};
use crate::channel::{TargetAddressType, Transport};
use crate::clock::time_after;
use crate::error::Nrc;
use crate::{UDS_TP_MTU, response_sid_of};

fn be16(b: &[u8]) -> u16 {
    (u16::from(b[0]) << 8) | u16::from(b[1])
}

fn be24(b: &[u8]) -> u32 {
    (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
}

/// Splits an addressAndLengthFormatIdentifier into (address bytes, size
/// bytes)
fn alfi_lengths(alfi: u8) -> (usize, usize) {
    ((alfi & 0x0F) as usize, ((alfi & 0xF0) >> 4) as usize)
}

/// Decodes the `entry`-th (memoryAddress, memorySize) pair following the
/// addressAndLengthFormatIdentifier at `buf[0]`
fn decode_address_and_length(buf: &[u8], entry: usize) -> Result<(usize, usize), Nrc> {
    if buf.is_empty() {
        return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
    }
    let (addr_len, size_len) = alfi_lengths(buf[0]);
    if size_len == 0 || size_len > size_of::<usize>() {
        return Err(Nrc::RequestOutOfRange);
    }
    if addr_len == 0 || addr_len > size_of::<usize>() {
        return Err(Nrc::RequestOutOfRange);
    }
    let off = 1 + entry * (addr_len + size_len);
    if off + addr_len + size_len > buf.len() {
        return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
    }
    let mut address = 0usize;
    for &b in &buf[off..off + addr_len] {
        address = (address << 8) | usize::from(b);
    }
    let mut size = 0usize;
    for &b in &buf[off + addr_len..off + addr_len + size_len] {
        size = (size << 8) | usize::from(b);
    }
    Ok((address, size))
}

/// ISO14229-1: securityAccessType 0x00, 0x43-0x5E and 0x7F are reserved
fn security_level_is_reserved(level: u8) -> bool {
    level == 0 || (0x43..=0x5E).contains(&level) || level == 0x7F
}

impl<T: Transport, H: ServiceHandler> UdsServer<T, H> {
    /// 0x10 DiagnosticSessionControl
    pub(super) fn handle_diagnostic_session_control(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let session_type = self.recv_buf[1] & 0x7F;

        let leaving_non_default = self.session_type != SESSION_DEFAULT && session_type == SESSION_DEFAULT;
        if leaving_non_default {
            // the user is not forced to handle this notification
            let _ = self.handler.handle(ServerEvent::AuthTimeout);
        }

        let mut timings = SessionTimings {
            p2_ms: self.cfg.p2_ms,
            p2_star_ms: self.cfg.p2_star_ms,
        };
        self.handler.handle(ServerEvent::DiagSessCtrl {
            session_type,
            timings: &mut timings,
        })?;

        if leaving_non_default {
            self.security_level = 0;
        }
        self.session_type = session_type;
        if session_type != SESSION_DEFAULT {
            self.refresh_s3();
        }

        self.send_buf.push(response_sid_of(0x10));
        self.send_buf.push(session_type);
        // UDS-1-2013 Table 29: P2 in 1ms resolution, P2* in 10ms resolution
        self.send_buf.extend_from_slice(&timings.p2_ms.to_be_bytes());
        self.send_buf
            .extend_from_slice(&((timings.p2_star_ms / 10) as u16).to_be_bytes());
        Ok(())
    }

    /// 0x11 ECUReset
    pub(super) fn handle_ecu_reset(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let reset_type = self.recv_buf[1] & 0x7F;
        if !(0x01..=0x05).contains(&reset_type) {
            return Err(Nrc::SubFunctionNotSupported);
        }

        let mut power_down_time_ms = self.cfg.power_down_time_ms;
        self.handler.handle(ServerEvent::EcuReset {
            reset_type,
            power_down_time_ms: &mut power_down_time_ms,
        })?;

        self.not_ready_to_receive = true;
        self.ecu_reset_scheduled = reset_type;
        self.ecu_reset_timer = self.now().wrapping_add(power_down_time_ms);

        self.send_buf.push(response_sid_of(0x11));
        self.send_buf.push(reset_type);
        if reset_type == RESET_ENABLE_RAPID_POWER_SHUTDOWN {
            self.send_buf
                .push((power_down_time_ms / 1000).min(255) as u8);
        }
        Ok(())
    }

    /// 0x14 ClearDiagnosticInformation
    pub(super) fn handle_clear_diagnostic_information(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 4 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let group_of_dtc = be24(&self.recv_buf[1..4]);
        let memory_selection = self.recv_buf.get(4).copied();
        self.handler.handle(ServerEvent::ClearDiagnosticInfo {
            group_of_dtc,
            memory_selection,
        })?;
        self.send_buf.push(response_sid_of(0x14));
        Ok(())
    }

    /// 0x19 ReadDTCInformation
    pub(super) fn handle_read_dtc_information(&mut self) -> ServiceResult {
        let r = &self.recv_buf;
        if r.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let sub = r[1];
        let need = |extra: usize| -> ServiceResult {
            if r.len() < 2 + extra {
                Err(Nrc::IncorrectMessageLengthOrInvalidFormat)
            } else {
                Ok(())
            }
        };
        let report = match sub {
            0x01 => {
                need(1)?;
                DtcReport::NumberOfDtcByStatusMask { mask: r[2] }
            }
            0x02 => {
                need(1)?;
                DtcReport::DtcByStatusMask { mask: r[2] }
            }
            0x03 => DtcReport::DtcSnapshotIdentification,
            0x04 => {
                need(4)?;
                DtcReport::DtcSnapshotRecordByDtcNumber {
                    dtc: be24(&r[2..5]),
                    record: r[5],
                }
            }
            0x05 => {
                need(1)?;
                DtcReport::DtcStoredDataByRecordNumber { record: r[2] }
            }
            0x06 => {
                need(4)?;
                DtcReport::DtcExtDataRecordByDtcNumber {
                    dtc: be24(&r[2..5]),
                    record: r[5],
                }
            }
            0x07 => {
                need(2)?;
                DtcReport::NumberOfDtcBySeverityMask {
                    severity_mask: r[2],
                    status_mask: r[3],
                }
            }
            0x08 => {
                need(2)?;
                DtcReport::DtcBySeverityMask {
                    severity_mask: r[2],
                    status_mask: r[3],
                }
            }
            0x09 => {
                need(3)?;
                DtcReport::SeverityInformationOfDtc { dtc: be24(&r[2..5]) }
            }
            0x0A => DtcReport::SupportedDtc,
            0x0B => DtcReport::FirstTestFailedDtc,
            0x0C => DtcReport::FirstConfirmedDtc,
            0x0D => DtcReport::MostRecentTestFailedDtc,
            0x0E => DtcReport::MostRecentConfirmedDtc,
            0x14 => DtcReport::DtcFaultDetectionCounter,
            0x15 => DtcReport::DtcWithPermanentStatus,
            0x16 => {
                need(1)?;
                DtcReport::DtcExtDataRecordByRecordNumber { record: r[2] }
            }
            0x17 => {
                need(2)?;
                DtcReport::UserDefMemoryDtcByStatusMask {
                    mask: r[2],
                    memory: r[3],
                }
            }
            0x18 => {
                need(5)?;
                DtcReport::UserDefMemoryDtcSnapshotRecordByDtcNumber {
                    dtc: be24(&r[2..5]),
                    record: r[5],
                    memory: r[6],
                }
            }
            0x19 => {
                need(5)?;
                DtcReport::UserDefMemoryDtcExtDataRecordByDtcNumber {
                    dtc: be24(&r[2..5]),
                    record: r[5],
                    memory: r[6],
                }
            }
            0x1A => {
                need(1)?;
                DtcReport::DtcExtendedDataRecordIdentification { record: r[2] }
            }
            0x42 => {
                need(3)?;
                DtcReport::WwhObdDtcByMaskRecord {
                    functional_group: r[2],
                    status_mask: r[3],
                    severity_mask: r[4],
                }
            }
            0x55 => {
                need(1)?;
                DtcReport::WwhObdDtcWithPermanentStatus { functional_group: r[2] }
            }
            0x56 => {
                need(2)?;
                DtcReport::DtcInformationByDtcReadinessGroup {
                    functional_group: r[2],
                    readiness_group: r[3],
                }
            }
            _ => {
                warn!("RDTCI subFunc 0x{sub:02X} is not supported");
                return Err(Nrc::SubFunctionNotSupported);
            }
        };

        self.send_buf.push(response_sid_of(0x19));
        self.send_buf.push(sub);
        let Self {
            handler, send_buf, ..
        } = self;
        handler.handle(ServerEvent::ReadDtcInformation {
            report,
            writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
        })
    }

    /// 0x22 ReadDataByIdentifier
    pub(super) fn handle_read_data_by_identifier(&mut self) -> ServiceResult {
        self.send_buf.push(response_sid_of(0x22));
        if (self.recv_buf.len() - 1) % 2 != 0 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let num_dids = self.recv_buf.len() / 2;
        if num_dids == 0 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }

        for i in 0..num_dids {
            let idx = 1 + i * 2;
            let did = be16(&self.recv_buf[idx..idx + 2]);
            if self.send_buf.len() + 3 > UDS_TP_MTU {
                return Err(Nrc::ResponseTooLong);
            }
            self.send_buf.extend_from_slice(&did.to_be_bytes());

            let before = self.send_buf.len();
            let Self {
                handler, send_buf, ..
            } = self;
            handler.handle(ServerEvent::ReadDataByIdent {
                did,
                writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
            })?;
            if self.send_buf.len() == before {
                error!("RDBI response positive but no data sent for DID 0x{did:04X}");
                return Err(Nrc::GeneralReject);
            }
        }
        Ok(())
    }

    /// 0x23 ReadMemoryByAddress
    pub(super) fn handle_read_memory_by_address(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 4 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let (address, size) = decode_address_and_length(&self.recv_buf[1..], 0)?;

        self.send_buf.push(response_sid_of(0x23));
        let Self {
            handler, send_buf, ..
        } = self;
        handler.handle(ServerEvent::ReadMemByAddr {
            address,
            size,
            writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
        })?;
        if self.send_buf.len() != 1 + size {
            error!(
                "read memory response positive but wrong length: expected {}, sent {}",
                size,
                self.send_buf.len() - 1
            );
            return Err(Nrc::GeneralReject);
        }
        Ok(())
    }

    /// 0x27 SecurityAccess
    pub(super) fn handle_security_access(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let sub = self.recv_buf[1];
        let level = sub & 0x7F;
        if security_level_is_reserved(level) {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }

        let now = self.now();
        if !time_after(now, self.sec_access_boot_delay_timer) {
            return Err(Nrc::RequiredTimeDelayNotExpired);
        }
        if !time_after(now, self.sec_access_auth_fail_timer) {
            return Err(Nrc::ExceedNumberOfAttempts);
        }

        self.send_buf.push(response_sid_of(0x27));
        self.send_buf.push(sub);

        if level % 2 == 0 {
            // sendKey: "requestSeed = 0x01" pairs with "sendKey = 0x02" and
            // so on
            let requested = level - 1;
            let result = {
                let Self {
                    handler, recv_buf, ..
                } = self;
                handler.handle(ServerEvent::SecAccessValidateKey {
                    level: requested,
                    key: &recv_buf[2..],
                })
            };
            if let Err(nrc) = result {
                self.sec_access_auth_fail_timer =
                    now.wrapping_add(self.cfg.sec_access_auth_fail_delay_ms);
                return Err(nrc);
            }
            self.security_level = requested;
            Ok(())
        } else {
            // requestSeed. An already-unlocked level answers with an
            // all-zero seed (UDS-1-2013 9.4.2.2); clients detect a locked
            // level by a non-zero seed.
            if level == self.security_level {
                self.send_buf.extend_from_slice(&[0x00, 0x00]);
                return Ok(());
            }
            let result = {
                let Self {
                    handler,
                    recv_buf,
                    send_buf,
                    ..
                } = self;
                handler.handle(ServerEvent::SecAccessRequestSeed {
                    level,
                    record: &recv_buf[2..],
                    writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
                })
            };
            result?;
            if self.send_buf.len() <= 2 {
                error!("0x27: no seed data was copied");
                return Err(Nrc::GeneralReject);
            }
            Ok(())
        }
    }

    /// 0x28 CommunicationControl
    pub(super) fn handle_communication_control(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 3 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let control_type = self.recv_buf[1] & 0x7F;
        let communication_type = self.recv_buf[2];
        let node_id = if control_type == 0x04 || control_type == 0x05 {
            if self.recv_buf.len() < 5 {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            }
            Some(be16(&self.recv_buf[3..5]))
        } else {
            None
        };

        self.handler.handle(ServerEvent::CommCtrl {
            control_type,
            communication_type,
            node_id,
        })?;

        self.send_buf.push(response_sid_of(0x28));
        self.send_buf.push(control_type);
        Ok(())
    }

    /// 0x29 Authentication (ISO14229-1:2020)
    pub(super) fn handle_authentication(&mut self) -> ServiceResult {
        let Self {
            handler,
            recv_buf,
            send_buf,
            ..
        } = self;
        let r: &[u8] = recv_buf;
        if r.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let sub = r[1];
        let malformed = Err(Nrc::IncorrectMessageLengthOrInvalidFormat);

        // two length-prefixed fields starting at `at`; returns both slices
        // and the index past them
        fn two_fields(r: &[u8], at: usize) -> Option<(&[u8], &[u8], usize)> {
            let first_len = usize::from(be16(r.get(at..at + 2)?));
            let first = r.get(at + 2..at + 2 + first_len)?;
            let at2 = at + 2 + first_len;
            let second_len = usize::from(be16(r.get(at2..at2 + 2)?));
            let second = r.get(at2 + 2..at2 + 2 + second_len)?;
            Some((first, second, at2 + 2 + second_len))
        }

        let mut algo_echo: Option<[u8; 16]> = None;
        let op = match sub {
            0x00 => AuthOp::DeAuthenticate,
            0x08 => AuthOp::AuthenticationConfiguration,
            0x01 | 0x02 => {
                if r.len() < 7 {
                    return malformed;
                }
                let comm_config = r[2];
                let Some((certificate, challenge, end)) = two_fields(r, 3) else {
                    return malformed;
                };
                if certificate.is_empty() {
                    warn!("Auth: certificate with zero length");
                    return malformed;
                }
                if sub == 0x02 && challenge.is_empty() {
                    return malformed;
                }
                if end != r.len() {
                    warn!("Auth: verify certificate request with malformed length");
                    return malformed;
                }
                if sub == 0x01 {
                    AuthOp::VerifyCertificateUnidirectional {
                        comm_config,
                        certificate,
                        challenge,
                    }
                } else {
                    AuthOp::VerifyCertificateBidirectional {
                        comm_config,
                        certificate,
                        challenge,
                    }
                }
            }
            0x03 => {
                if r.len() < 6 {
                    return malformed;
                }
                let Some((proof, ephemeral_public_key, end)) = two_fields(r, 2) else {
                    return malformed;
                };
                if proof.is_empty() {
                    warn!("Auth: proof of ownership with zero length");
                    return malformed;
                }
                if end != r.len() {
                    return malformed;
                }
                AuthOp::ProofOfOwnership {
                    proof,
                    ephemeral_public_key,
                }
            }
            0x04 => {
                if r.len() < 5 {
                    return malformed;
                }
                let evaluation_id = r[2];
                let len = usize::from(be16(&r[3..5]));
                if len == 0 {
                    warn!("Auth: transmit certificate with zero length");
                    return malformed;
                }
                let Some(certificate) = r.get(5..5 + len) else {
                    return malformed;
                };
                if 5 + len != r.len() {
                    return malformed;
                }
                AuthOp::TransmitCertificate {
                    evaluation_id,
                    certificate,
                }
            }
            0x05 => {
                if r.len() < 2 + 1 + 16 {
                    return malformed;
                }
                let mut algo = [0u8; 16];
                algo.copy_from_slice(&r[3..19]);
                algo_echo = Some(algo);
                AuthOp::RequestChallengeForAuthentication {
                    comm_config: r[2],
                    algorithm: &r[3..19],
                }
            }
            0x06 | 0x07 => {
                if r.len() < 2 + 16 + 2 + 2 + 2 {
                    return malformed;
                }
                let mut algo = [0u8; 16];
                algo.copy_from_slice(&r[2..18]);
                algo_echo = Some(algo);

                let pown_len = usize::from(be16(&r[18..20]));
                if pown_len == 0 {
                    warn!("Auth: verify proof of ownership with zero pown length");
                    return malformed;
                }
                let Some(proof) = r.get(20..20 + pown_len) else {
                    return malformed;
                };
                let Some((challenge, additional, end)) = two_fields(r, 20 + pown_len) else {
                    return malformed;
                };
                if end != r.len() {
                    return malformed;
                }
                if sub == 0x06 {
                    AuthOp::VerifyProofOfOwnershipUnidirectional {
                        algorithm: &r[2..18],
                        proof,
                        challenge,
                        additional,
                    }
                } else {
                    AuthOp::VerifyProofOfOwnershipBidirectional {
                        algorithm: &r[2..18],
                        proof,
                        challenge,
                        additional,
                    }
                }
            }
            _ => return Err(Nrc::SubFunctionNotSupported),
        };

        send_buf.push(response_sid_of(0x29));
        send_buf.push(sub);
        // expected to be overridden through the event's auth_state field
        send_buf.push(auth_state::GENERAL_REJECT);
        if let Some(algo) = algo_echo {
            send_buf.extend_from_slice(&algo);
        }

        let mut state = auth_state::GENERAL_REJECT;
        handler.handle(ServerEvent::Auth {
            op,
            auth_state: &mut state,
            writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
        })?;
        send_buf[2] = state;
        Ok(())
    }

    /// 0x2C DynamicallyDefineDataIdentifier
    pub(super) fn handle_dynamically_define_data_id(&mut self) -> ServiceResult {
        let len = self.recv_buf.len();
        if len < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let sub = self.recv_buf[1];
        match sub {
            0x01 => {
                if len < 8 || (len - 4) % 4 != 0 {
                    return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
                }
                let dynamic_did = be16(&self.recv_buf[2..4]);
                self.send_buf
                    .extend_from_slice(&[response_sid_of(0x2C), sub]);
                self.send_buf.extend_from_slice(&dynamic_did.to_be_bytes());

                for i in 0..(len - 4) / 4 {
                    let at = 4 + i * 4;
                    let op = DynamicDefineOp::ById {
                        dynamic_did,
                        source_did: be16(&self.recv_buf[at..at + 2]),
                        position: self.recv_buf[at + 2],
                        size: self.recv_buf[at + 3],
                    };
                    self.handler.handle(ServerEvent::DynamicDefineDataId { op })?;
                }
                Ok(())
            }
            0x02 => {
                if len < 7 {
                    return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
                }
                let dynamic_did = be16(&self.recv_buf[2..4]);
                let (addr_len, size_len) = alfi_lengths(self.recv_buf[4]);
                if addr_len + size_len == 0 {
                    warn!(
                        "DDDI: defineByMemoryAddress with invalid format identifier 0x{:02X}",
                        self.recv_buf[4]
                    );
                    return Err(Nrc::RequestOutOfRange);
                }
                if (len - 5) % (addr_len + size_len) != 0 {
                    return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
                }
                self.send_buf
                    .extend_from_slice(&[response_sid_of(0x2C), sub]);
                self.send_buf.extend_from_slice(&dynamic_did.to_be_bytes());

                for i in 0..(len - 5) / (addr_len + size_len) {
                    let (address, size) = decode_address_and_length(&self.recv_buf[4..], i)?;
                    let op = DynamicDefineOp::ByMemoryAddress {
                        dynamic_did,
                        address,
                        size,
                    };
                    self.handler.handle(ServerEvent::DynamicDefineDataId { op })?;
                }
                Ok(())
            }
            0x03 => {
                let dynamic_did = match len {
                    2 => None,
                    4.. => Some(be16(&self.recv_buf[2..4])),
                    _ => return Err(Nrc::IncorrectMessageLengthOrInvalidFormat),
                };
                self.send_buf
                    .extend_from_slice(&[response_sid_of(0x2C), sub]);
                if let Some(did) = dynamic_did {
                    self.send_buf.extend_from_slice(&did.to_be_bytes());
                }
                self.handler.handle(ServerEvent::DynamicDefineDataId {
                    op: DynamicDefineOp::Clear { dynamic_did },
                })
            }
            _ => {
                warn!("unsupported DDDI subFunc 0x{sub:02X}");
                Err(Nrc::SubFunctionNotSupported)
            }
        }
    }

    /// 0x2E WriteDataByIdentifier
    pub(super) fn handle_write_data_by_identifier(&mut self) -> ServiceResult {
        // UDS-1 2013 Figure 21 Key 1: at least one data byte
        if self.recv_buf.len() < 4 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let did = be16(&self.recv_buf[1..3]);
        {
            let Self {
                handler, recv_buf, ..
            } = self;
            handler.handle(ServerEvent::WriteDataByIdent {
                did,
                data: &recv_buf[3..],
            })?;
        }
        self.send_buf.push(response_sid_of(0x2E));
        self.send_buf.extend_from_slice(&did.to_be_bytes());
        Ok(())
    }

    /// 0x2F InputOutputControlByIdentifier
    pub(super) fn handle_io_control(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 4 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let did = be16(&self.recv_buf[1..3]);
        let control_param = self.recv_buf[3];
        self.send_buf.extend_from_slice(&[
            response_sid_of(0x2F),
            self.recv_buf[1],
            self.recv_buf[2],
            control_param,
        ]);
        let Self {
            handler,
            recv_buf,
            send_buf,
            ..
        } = self;
        handler.handle(ServerEvent::IoControl {
            did,
            control_param,
            state_and_mask: &recv_buf[4..],
            writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
        })
    }

    /// 0x31 RoutineControl
    pub(super) fn handle_routine_control(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 4 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let control_type = self.recv_buf[1] & 0x7F;
        let routine_id = be16(&self.recv_buf[2..4]);
        if !(0x01..=0x03).contains(&control_type) {
            return Err(Nrc::RequestOutOfRange);
        }

        self.send_buf.push(response_sid_of(0x31));
        self.send_buf.push(control_type);
        self.send_buf.extend_from_slice(&routine_id.to_be_bytes());

        let Self {
            handler,
            recv_buf,
            send_buf,
            ..
        } = self;
        handler.handle(ServerEvent::RoutineCtrl {
            control_type,
            routine_id,
            record: &recv_buf[4..],
            writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
        })
    }

    /// 0x34 RequestDownload
    pub(super) fn handle_request_download(&mut self) -> ServiceResult {
        self.handle_transfer_request(false)
    }

    /// 0x35 RequestUpload
    pub(super) fn handle_request_upload(&mut self) -> ServiceResult {
        self.handle_transfer_request(true)
    }

    fn handle_transfer_request(&mut self, upload: bool) -> ServiceResult {
        if self.xfer_active {
            return Err(Nrc::ConditionsNotCorrect);
        }
        if self.recv_buf.len() < 3 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let data_format = self.recv_buf[1];
        let (address, size) = decode_address_and_length(&self.recv_buf[2..], 0)?;

        let mut max_block_len = self.cfg.xfer_max_block_length;
        let result = self.handler.handle(if upload {
            ServerEvent::RequestUpload {
                address,
                size,
                data_format,
                max_block_len: &mut max_block_len,
            }
        } else {
            ServerEvent::RequestDownload {
                address,
                size,
                data_format,
                max_block_len: &mut max_block_len,
            }
        });

        // ISO-14229-1:2013 Table 396: the block length includes the SID and
        // blockSequenceCounter, so anything below 3 cannot carry data
        if max_block_len < 3 {
            error!("maxNumberOfBlockLength too short");
            return Err(Nrc::GeneralReject);
        }
        result?;

        max_block_len = max_block_len.min(UDS_TP_MTU as u16);
        self.reset_transfer();
        self.xfer_active = true;
        self.xfer_total_bytes = size;
        self.xfer_block_length = max_block_len;

        // ISO-14229-1:2013 Table 401
        let length_format_identifier = (size_of::<u16>() as u8) << 4;
        self.send_buf
            .push(response_sid_of(if upload { 0x35 } else { 0x34 }));
        self.send_buf.push(length_format_identifier);
        self.send_buf.extend_from_slice(&max_block_len.to_be_bytes());
        Ok(())
    }

    /// 0x36 TransferData
    pub(super) fn handle_transfer_data(&mut self) -> ServiceResult {
        if !self.xfer_active {
            return Err(Nrc::UploadDownloadNotAccepted);
        }
        if self.recv_buf.len() < 2 {
            self.reset_transfer();
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let block_seq_counter = self.recv_buf[1];

        // a 0x78 re-invocation must not advance the counter
        if !self.rcrrp_pending {
            if block_seq_counter != self.xfer_block_seq_counter {
                self.reset_transfer();
                return Err(Nrc::WrongBlockSequenceCounter);
            }
            self.xfer_block_seq_counter = self.xfer_block_seq_counter.wrapping_add(1);
        }

        let data_len = self.recv_buf.len() - 2;
        if self.xfer_byte_counter + data_len > self.xfer_total_bytes {
            self.reset_transfer();
            return Err(Nrc::TransferDataSuspended);
        }

        self.send_buf.push(response_sid_of(0x36));
        self.send_buf.push(block_seq_counter);
        let max_resp_len = self.xfer_block_length - 2;
        let result = {
            let Self {
                handler,
                recv_buf,
                send_buf,
                ..
            } = self;
            handler.handle(ServerEvent::TransferData {
                data: &recv_buf[2..],
                max_resp_len,
                writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
            })
        };
        match result {
            Ok(()) => {
                self.xfer_byte_counter += data_len;
                Ok(())
            }
            Err(Nrc::RequestCorrectlyReceivedResponsePending) => {
                Err(Nrc::RequestCorrectlyReceivedResponsePending)
            }
            Err(nrc) => {
                self.reset_transfer();
                Err(nrc)
            }
        }
    }

    /// 0x37 RequestTransferExit
    pub(super) fn handle_request_transfer_exit(&mut self) -> ServiceResult {
        if !self.xfer_active {
            return Err(Nrc::UploadDownloadNotAccepted);
        }
        self.send_buf.push(response_sid_of(0x37));
        let result = {
            let Self {
                handler,
                recv_buf,
                send_buf,
                ..
            } = self;
            handler.handle(ServerEvent::RequestTransferExit {
                data: &recv_buf[1..],
                writer: ResponseWriter::new(send_buf, UDS_TP_MTU),
            })
        };
        match result {
            Ok(()) => {
                self.reset_transfer();
                Ok(())
            }
            Err(Nrc::RequestCorrectlyReceivedResponsePending) => {
                Err(Nrc::RequestCorrectlyReceivedResponsePending)
            }
            Err(nrc) => {
                self.reset_transfer();
                Err(nrc)
            }
        }
    }

    /// 0x38 RequestFileTransfer
    pub(super) fn handle_request_file_transfer(&mut self) -> ServiceResult {
        if self.xfer_active {
            return Err(Nrc::ConditionsNotCorrect);
        }
        let r = &self.recv_buf;
        if r.len() < 4 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let Some(mode) = FileOperation::from_repr(r[1]) else {
            return Err(Nrc::RequestOutOfRange);
        };
        let file_path_len = usize::from(be16(&r[2..4]));
        if file_path_len == 0 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let mut idx = 4 + file_path_len;
        if idx > r.len() {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }

        // ISO14229:2020 Table 481: DeleteFile and ReadDir requests carry no
        // dataFormatIdentifier
        let data_format = if matches!(mode, FileOperation::DeleteFile | FileOperation::ReadDir) {
            0
        } else {
            let Some(&dfi) = r.get(idx) else {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            };
            idx += 1;
            dfi
        };

        // Table 481 again: DeleteFile, ReadFile and ReadDir requests carry
        // no file size parameters
        let (file_size_uncompressed, file_size_compressed) = if matches!(
            mode,
            FileOperation::DeleteFile | FileOperation::ReadFile | FileOperation::ReadDir
        ) {
            (0, 0)
        } else {
            let Some(&fspl) = r.get(idx) else {
                return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
            };
            idx += 1;
            let fspl = usize::from(fspl);
            if fspl > size_of::<usize>() {
                return Err(Nrc::RequestOutOfRange);
            }
            if idx + 2 * fspl > r.len() {
                return Err(Nrc::RequestOutOfRange);
            }
            let mut uncompressed = 0usize;
            for &b in &r[idx..idx + fspl] {
                uncompressed = (uncompressed << 8) | usize::from(b);
            }
            let mut compressed = 0usize;
            for &b in &r[idx + fspl..idx + 2 * fspl] {
                compressed = (compressed << 8) | usize::from(b);
            }
            (uncompressed, compressed)
        };

        let mut max_block_len = self.cfg.xfer_max_block_length;
        let result = {
            let Self {
                handler, recv_buf, ..
            } = self;
            handler.handle(ServerEvent::RequestFileTransfer {
                mode,
                file_path: &recv_buf[4..4 + file_path_len],
                data_format,
                file_size_uncompressed,
                file_size_compressed,
                max_block_len: &mut max_block_len,
            })
        };
        if max_block_len < 3 {
            error!("maxNumberOfBlockLength too short");
            return Err(Nrc::GeneralReject);
        }
        result?;

        max_block_len = max_block_len.min(UDS_TP_MTU as u16);
        self.reset_transfer();
        self.xfer_active = true;
        self.xfer_total_bytes = file_size_compressed;
        self.xfer_block_length = max_block_len;

        self.send_buf.push(response_sid_of(0x38));
        self.send_buf.push(mode as u8);
        self.send_buf.push(size_of::<u16>() as u8);
        self.send_buf.extend_from_slice(&max_block_len.to_be_bytes());
        self.send_buf.push(data_format);
        Ok(())
    }

    /// 0x3D WriteMemoryByAddress
    pub(super) fn handle_write_memory_by_address(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 5 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let (address, size) = decode_address_and_length(&self.recv_buf[1..], 0)?;
        let (addr_len, size_len) = alfi_lengths(self.recv_buf[1]);
        let data_offset = 2 + addr_len + size_len;
        if data_offset + size != self.recv_buf.len() {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }

        {
            let Self {
                handler, recv_buf, ..
            } = self;
            handler.handle(ServerEvent::WriteMemByAddr {
                address,
                size,
                data: &recv_buf[data_offset..],
            })?;
        }

        self.send_buf.push(response_sid_of(0x3D));
        // echo addressAndLengthFormatIdentifier, memoryAddress and
        // memorySize
        let echo = self.recv_buf[1..data_offset].to_vec();
        self.send_buf.extend_from_slice(&echo);
        Ok(())
    }

    /// 0x3E TesterPresent
    pub(super) fn handle_tester_present(&mut self) -> ServiceResult {
        if self.recv_buf.len() != 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        match self.recv_buf[1] {
            0x00 | 0x80 => {
                self.refresh_s3();
                self.send_buf.push(response_sid_of(0x3E));
                self.send_buf.push(0x00);
                Ok(())
            }
            _ => Err(Nrc::SubFunctionNotSupported),
        }
    }

    /// 0x85 ControlDTCSetting
    pub(super) fn handle_control_dtc_setting(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let setting_type = self.recv_buf[1] & 0x7F;
        {
            let Self {
                handler, recv_buf, ..
            } = self;
            handler.handle(ServerEvent::ControlDtcSetting {
                setting_type,
                record: &recv_buf[2..],
            })?;
        }
        self.send_buf.push(response_sid_of(0x85));
        self.send_buf.push(setting_type);
        Ok(())
    }

    /// 0x87 LinkControl
    pub(super) fn handle_link_control(&mut self) -> ServiceResult {
        if self.recv_buf.len() < 2 {
            return Err(Nrc::IncorrectMessageLengthOrInvalidFormat);
        }
        let raw_sub = self.recv_buf[1];
        let control_type = raw_sub & 0x7F;

        if control_type == 0x03
            && raw_sub & 0x80 == 0
            && self.recv_info.ta_type == TargetAddressType::Functional
        {
            warn!("0x87 LinkControl: transitioning mode without suppressing response");
        }

        // echo the raw sub-function byte to preserve the suppress bit
        self.send_buf.push(response_sid_of(0x87));
        self.send_buf.push(raw_sub);

        let Self {
            handler, recv_buf, ..
        } = self;
        handler.handle(ServerEvent::LinkControl {
            control_type,
            record: &recv_buf[2..],
        })
    }
}
