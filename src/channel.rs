//! The transport boundary between the UDS state machines and the link
//!
//! [Transport] moves whole service data units; implementations either
//! segment in software over a [CanBus] ([crate::isotp::IsoTpTransport]) or
//! move SDUs directly ([crate::sim::SimTransport], OS ISO-TP sockets).

use bitflags::bitflags;

use crate::error::{TransportError, TransportResult};

/// UDS message category (A_Mtype). Only plain diagnostics is carried by this
/// stack; remote/secure variants are routed to user hooks by their SIDs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mtype {
    /// Plain diagnostic message
    #[default]
    Diagnostic,
}

/// Target address type of an SDU (ISO14229-2 A_TA_Type)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TargetAddressType {
    /// Unicast (1:1)
    #[default]
    Physical,
    /// Multicast (1:n). Functional SDUs must fit in a single link frame.
    Functional,
}

/// Addressing information attached to one SDU as it crosses the transport
/// boundary
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SduInfo {
    /// Message category
    pub mtype: Mtype,
    /// Source address (opaque; typically an 11 or 29 bit CAN id)
    pub source: u32,
    /// Target address
    pub target: u32,
    /// Physical or functional addressing
    pub ta_type: TargetAddressType,
}

bitflags! {
    /// Transport status bits returned by [Transport::poll]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct TpStatus: u32 {
        /// A transmission is still in flight
        const SEND_IN_PROGRESS = 0x01;
        /// A fully assembled SDU is waiting to be read with `recv`
        const RECV_COMPLETE = 0x02;
        /// The transport hit a link-level error since the last poll
        const ERROR = 0x04;
    }
}

/// A transport carries one service data unit at a time in each direction.
///
/// Implementations must either copy the caller's buffer or complete the
/// transmission before `send` returns; the caller's slice is not borrowed
/// past the call.
pub trait Transport {
    /// Submits one SDU for transmission.
    ///
    /// Returns `Ok(len)` when the SDU was sent or accepted whole; software
    /// segmenters report [TpStatus::SEND_IN_PROGRESS] from
    /// [Transport::poll] until the last frame is out. `Ok(0)` means the
    /// transport cannot take the SDU at this moment and the caller should
    /// retry on a later poll. Functionally addressed SDUs that do not fit
    /// in a single link frame are rejected with
    /// [TransportError::FunctionalSduTooLarge].
    fn send(&mut self, data: &[u8], info: &SduInfo) -> TransportResult<usize>;

    /// Reads at most one fully assembled SDU into `buf`.
    ///
    /// Returns `Ok(None)` when nothing has arrived. Physical and functional
    /// addressing share this one receive stream; the returned [SduInfo]
    /// carries the distinction.
    fn recv(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SduInfo)>>;

    /// Advances the transport's internal state machines and reports status
    fn poll(&mut self) -> TpStatus;
}

/// One classic CAN frame (11 or 29 bit id, up to 8 data bytes)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    data: [u8; 8],
    len: u8,
}

impl CanFrame {
    /// Creates a frame from an id and up to 8 payload bytes.
    ///
    /// Panics if `data` is longer than 8 bytes.
    pub fn new(id: u32, data: &[u8]) -> Self {
        assert!(data.len() <= 8, "CAN frame payload larger than 8 bytes");
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        Self {
            id,
            data: buf,
            len: data.len() as u8,
        }
    }

    /// Arbitration id of the frame
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// A non-blocking frame-level CAN interface used by the software segmenter.
///
/// Both operations must return immediately; `recv` yields `None` when no
/// frame is pending.
pub trait CanBus {
    /// Queues one frame for transmission
    fn send(&mut self, frame: CanFrame) -> Result<(), TransportError>;
    /// Takes the next pending received frame, if any
    fn recv(&mut self) -> Option<CanFrame>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_frame_truncates_to_payload_len() {
        let f = CanFrame::new(0x7E0, &[0x02, 0x10, 0x03]);
        assert_eq!(f.id(), 0x7E0);
        assert_eq!(f.data(), &[0x02, 0x10, 0x03]);
    }
}
