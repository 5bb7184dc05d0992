//! Request builders and response unpack helpers for the standard services
//!
//! Each builder lays the request out per ISO14229-1 and hands it to the
//! client's state machine; all of them fail with [ClientError::Busy] while
//! a request is outstanding. The unpack helpers parse positive response
//! buffers delivered through [super::ClientEvent::ResponseReceived].

use super::{ClientEventHandler, UdsClient};
use crate::channel::Transport;
use crate::error::{ClientError, ClientResult};
use crate::{ServiceId, response_sid_of};

impl<T: Transport, H: ClientEventHandler> UdsClient<T, H> {
    /// Sends a raw request
    pub fn send_bytes(&mut self, data: &[u8]) -> ClientResult<()> {
        self.send_request(data)
    }

    /// 0x10 DiagnosticSessionControl
    pub fn send_diag_sess_ctrl(&mut self, session_type: u8) -> ClientResult<()> {
        self.send_request(&[ServiceId::DiagnosticSessionControl as u8, session_type])
    }

    /// 0x11 ECUReset
    pub fn send_ecu_reset(&mut self, reset_type: u8) -> ClientResult<()> {
        self.send_request(&[ServiceId::EcuReset as u8, reset_type])
    }

    /// 0x3E TesterPresent (sub-function zero)
    pub fn send_tester_present(&mut self) -> ClientResult<()> {
        self.send_request(&[ServiceId::TesterPresent as u8, 0x00])
    }

    /// 0x28 CommunicationControl
    pub fn send_comm_ctrl(&mut self, control_type: u8, communication_type: u8) -> ClientResult<()> {
        self.send_request(&[
            ServiceId::CommunicationControl as u8,
            control_type,
            communication_type,
        ])
    }

    /// 0x27 SecurityAccess: odd `level` requests a seed, even `level`
    /// delivers the key in `data`
    pub fn send_security_access(&mut self, level: u8, data: &[u8]) -> ClientResult<()> {
        if level == 0 || (0x43..=0x5E).contains(&level) || level == 0x7F {
            return Err(ClientError::InvalidArg);
        }
        let mut req = Vec::with_capacity(2 + data.len());
        req.push(ServiceId::SecurityAccess as u8);
        req.push(level);
        req.extend_from_slice(data);
        self.send_request(&req)
    }

    /// 0x22 ReadDataByIdentifier for one or more DIDs
    pub fn send_read_data_by_ident(&mut self, dids: &[u16]) -> ClientResult<()> {
        if dids.is_empty() {
            return Err(ClientError::InvalidArg);
        }
        let mut req = Vec::with_capacity(1 + 2 * dids.len());
        req.push(ServiceId::ReadDataByIdentifier as u8);
        for did in dids {
            req.extend_from_slice(&did.to_be_bytes());
        }
        self.send_request(&req)
    }

    /// 0x2E WriteDataByIdentifier
    pub fn send_write_data_by_ident(&mut self, did: u16, data: &[u8]) -> ClientResult<()> {
        if data.is_empty() {
            return Err(ClientError::InvalidArg);
        }
        let mut req = Vec::with_capacity(3 + data.len());
        req.push(ServiceId::WriteDataByIdentifier as u8);
        req.extend_from_slice(&did.to_be_bytes());
        req.extend_from_slice(data);
        self.send_request(&req)
    }

    /// 0x31 RoutineControl
    pub fn send_routine_ctrl(
        &mut self,
        control_type: u8,
        routine_id: u16,
        option_record: &[u8],
    ) -> ClientResult<()> {
        let mut req = Vec::with_capacity(4 + option_record.len());
        req.push(ServiceId::RoutineControl as u8);
        req.push(control_type);
        req.extend_from_slice(&routine_id.to_be_bytes());
        req.extend_from_slice(option_record);
        self.send_request(&req)
    }

    /// 0x34 RequestDownload
    pub fn send_request_download(
        &mut self,
        data_format: u8,
        alfi: u8,
        memory_address: usize,
        memory_size: usize,
    ) -> ClientResult<()> {
        self.send_memory_transfer_request(
            ServiceId::RequestDownload as u8,
            data_format,
            alfi,
            memory_address,
            memory_size,
        )
    }

    /// 0x35 RequestUpload
    pub fn send_request_upload(
        &mut self,
        data_format: u8,
        alfi: u8,
        memory_address: usize,
        memory_size: usize,
    ) -> ClientResult<()> {
        self.send_memory_transfer_request(
            ServiceId::RequestUpload as u8,
            data_format,
            alfi,
            memory_address,
            memory_size,
        )
    }

    fn send_memory_transfer_request(
        &mut self,
        sid: u8,
        data_format: u8,
        alfi: u8,
        memory_address: usize,
        memory_size: usize,
    ) -> ClientResult<()> {
        let size_len = usize::from((alfi & 0xF0) >> 4);
        let addr_len = usize::from(alfi & 0x0F);
        if addr_len == 0 || addr_len > size_of::<usize>() || size_len == 0
            || size_len > size_of::<usize>()
        {
            return Err(ClientError::InvalidArg);
        }
        let mut req = Vec::with_capacity(3 + addr_len + size_len);
        req.push(sid);
        req.push(data_format);
        req.push(alfi);
        for i in (0..addr_len).rev() {
            req.push((memory_address >> (8 * i)) as u8);
        }
        for i in (0..size_len).rev() {
            req.push((memory_size >> (8 * i)) as u8);
        }
        self.send_request(&req)
    }

    /// 0x36 TransferData. `block_length` is the maxNumberOfBlockLength the
    /// server advertised; `data` must leave room for the two header bytes.
    pub fn send_transfer_data(
        &mut self,
        block_seq_counter: u8,
        block_length: u16,
        data: &[u8],
    ) -> ClientResult<()> {
        if block_length <= 2 || data.len() + 2 > usize::from(block_length) {
            return Err(ClientError::InvalidArg);
        }
        let mut req = Vec::with_capacity(2 + data.len());
        req.push(ServiceId::TransferData as u8);
        req.push(block_seq_counter);
        req.extend_from_slice(data);
        self.send_request(&req)
    }

    /// 0x37 RequestTransferExit
    pub fn send_request_transfer_exit(&mut self) -> ClientResult<()> {
        self.send_request(&[ServiceId::RequestTransferExit as u8])
    }

    /// 0x38 RequestFileTransfer. `file_size_parameter_length` selects how
    /// many bytes encode each file size; only AddFile, ReplaceFile and
    /// ResumeFile requests carry sizes, and only DeleteFile and ReadDir
    /// omit the dataFormatIdentifier.
    #[allow(clippy::too_many_arguments)]
    pub fn send_request_file_transfer(
        &mut self,
        mode: u8,
        file_path: &[u8],
        data_format: u8,
        file_size_parameter_length: u8,
        file_size_uncompressed: usize,
        file_size_compressed: usize,
    ) -> ClientResult<()> {
        if file_path.is_empty() || !(1..=6).contains(&mode) {
            return Err(ClientError::InvalidArg);
        }
        let has_dfi = !matches!(mode, 2 | 5);
        let has_sizes = !matches!(mode, 2 | 4 | 5);
        let fspl = usize::from(file_size_parameter_length);
        if has_sizes && (fspl == 0 || fspl > size_of::<usize>()) {
            return Err(ClientError::InvalidArg);
        }

        let mut req = Vec::new();
        req.push(ServiceId::RequestFileTransfer as u8);
        req.push(mode);
        req.extend_from_slice(&(file_path.len() as u16).to_be_bytes());
        req.extend_from_slice(file_path);
        if has_dfi {
            req.push(data_format);
        }
        if has_sizes {
            req.push(file_size_parameter_length);
            for i in (0..fspl).rev() {
                req.push((file_size_uncompressed >> (8 * i)) as u8);
            }
            for i in (0..fspl).rev() {
                req.push((file_size_compressed >> (8 * i)) as u8);
            }
        }
        self.send_request(&req)
    }

    /// 0x85 ControlDTCSetting
    pub fn send_ctrl_dtc_setting(&mut self, setting_type: u8, record: &[u8]) -> ClientResult<()> {
        if setting_type == 0x00 || setting_type == 0x7F || (0x03..=0x3F).contains(&setting_type) {
            return Err(ClientError::InvalidArg);
        }
        let mut req = Vec::with_capacity(2 + record.len());
        req.push(ServiceId::ControlDtcSetting as u8);
        req.push(setting_type);
        req.extend_from_slice(record);
        self.send_request(&req)
    }
}

/// Parsed 0x27 positive response
#[derive(Debug, PartialEq, Eq)]
pub struct SecurityAccessResponse<'a> {
    /// Echoed securityAccessType
    pub access_type: u8,
    /// Seed bytes; empty on a sendKey response or when the level was
    /// already unlocked with a zero-length seed
    pub seed: &'a [u8],
}

/// Parsed 0x31 positive response
#[derive(Debug, PartialEq, Eq)]
pub struct RoutineControlResponse<'a> {
    /// Echoed routineControlType
    pub control_type: u8,
    /// Echoed routineIdentifier
    pub routine_id: u16,
    /// routineStatusRecord bytes
    pub status_record: &'a [u8],
}

/// Extracts one DID's data record from a (possibly multi-DID) 0x22 positive
/// response.
///
/// `offset` carries the parse position across calls; start it at 0 and call
/// once per requested DID, in request order, with each DID's known record
/// size in `data.len()`.
pub fn unpack_rdbi_response(
    resp: &[u8],
    did: u16,
    data: &mut [u8],
    offset: &mut usize,
) -> ClientResult<()> {
    if *offset == 0 {
        *offset = 1;
    }
    if *offset + 2 > resp.len() {
        return Err(ClientError::ResponseTooShort);
    }
    let their_did = (u16::from(resp[*offset]) << 8) | u16::from(resp[*offset + 1]);
    if their_did != did {
        return Err(ClientError::DidMismatch);
    }
    if *offset + 2 + data.len() > resp.len() {
        return Err(ClientError::ResponseTooShort);
    }
    data.copy_from_slice(&resp[*offset + 2..*offset + 2 + data.len()]);
    *offset += 2 + data.len();
    Ok(())
}

/// Parses a 0x27 positive response
pub fn unpack_security_access_response(resp: &[u8]) -> ClientResult<SecurityAccessResponse<'_>> {
    if resp.first() != Some(&response_sid_of(ServiceId::SecurityAccess as u8)) {
        return Err(ClientError::SidMismatch);
    }
    if resp.len() < 2 {
        return Err(ClientError::ResponseTooShort);
    }
    Ok(SecurityAccessResponse {
        access_type: resp[1],
        seed: &resp[2..],
    })
}

/// Parses a 0x31 positive response
pub fn unpack_routine_control_response(resp: &[u8]) -> ClientResult<RoutineControlResponse<'_>> {
    if resp.first() != Some(&response_sid_of(ServiceId::RoutineControl as u8)) {
        return Err(ClientError::SidMismatch);
    }
    if resp.len() < 4 {
        return Err(ClientError::ResponseTooShort);
    }
    Ok(RoutineControlResponse {
        control_type: resp[1],
        routine_id: (u16::from(resp[2]) << 8) | u16::from(resp[3]),
        status_record: &resp[4..],
    })
}

/// Parses a 0x34 positive response into the advertised
/// maxNumberOfBlockLength
pub fn unpack_request_download_response(resp: &[u8]) -> ClientResult<usize> {
    if resp.first() != Some(&response_sid_of(ServiceId::RequestDownload as u8)) {
        return Err(ClientError::SidMismatch);
    }
    if resp.len() < 2 {
        return Err(ClientError::ResponseTooShort);
    }
    let len_bytes = usize::from((resp[1] & 0xF0) >> 4);
    if len_bytes > size_of::<usize>() {
        return Err(ClientError::InvalidArg);
    }
    if resp.len() < 2 + len_bytes {
        return Err(ClientError::ResponseTooShort);
    }
    let mut max_block_len = 0usize;
    for &b in &resp[2..2 + len_bytes] {
        max_block_len = (max_block_len << 8) | usize::from(b);
    }
    Ok(max_block_len)
}
