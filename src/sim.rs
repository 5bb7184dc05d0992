//! In-memory mock network moving whole SDUs between endpoints
//!
//! This is the transport used by the integration tests and doc examples: a
//! hub that routes SDUs between [SimTransport] endpoints by target address,
//! with an optional per-endpoint transmit delay driven by the shared clock.
//! Functional sends are limited to 7 bytes, matching a classic CAN single
//! frame.

use std::sync::{Arc, Mutex};

use log::warn;

use crate::UDS_TP_MTU;
use crate::channel::{Mtype, SduInfo, TargetAddressType, TpStatus, Transport};
use crate::clock::{SharedClock, time_after};
use crate::error::{TransportError, TransportResult};

/// Single-frame payload capacity of a classic CAN link
const FUNCTIONAL_MAX: usize = 7;

struct InFlight {
    from: usize,
    buf: Vec<u8>,
    info: SduInfo,
    due: u32,
}

struct Mailbox {
    recv_addr: u32,
    recv_addr_func: Option<u32>,
    inbox: Option<(Vec<u8>, SduInfo)>,
}

#[derive(Default)]
struct NetState {
    wire: Vec<InFlight>,
    boxes: Vec<Mailbox>,
}

/// Hub connecting any number of [SimTransport] endpoints
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<NetState>>,
    clock: SharedClock,
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork").finish_non_exhaustive()
    }
}

impl SimNetwork {
    /// Creates an empty network on the given timebase
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState::default())),
            clock,
        }
    }

    /// Registers an endpoint.
    ///
    /// * `send_addr` - address this endpoint transmits to (the peer listens
    ///   on it)
    /// * `recv_addr` - address this endpoint listens on
    /// * `func` - optional `(send, recv)` functional address pair
    pub fn endpoint(&self, send_addr: u32, recv_addr: u32, func: Option<(u32, u32)>) -> SimTransport {
        let mut st = self.state.lock().unwrap();
        st.boxes.push(Mailbox {
            recv_addr,
            recv_addr_func: func.map(|(_, rx)| rx),
            inbox: None,
        });
        SimTransport {
            state: self.state.clone(),
            clock: self.clock.clone(),
            slot: st.boxes.len() - 1,
            send_addr,
            recv_addr,
            send_addr_func: func.map(|(tx, _)| tx),
            tx_delay_ms: 0,
        }
    }

    fn deliver_due(&self, now: u32) {
        deliver_due(&mut self.state.lock().unwrap(), now);
    }

    /// Delivers everything currently on the wire (ignoring transmit delays).
    /// Useful for tests that do not poll every endpoint.
    pub fn flush(&self) {
        self.deliver_due(self.clock.millis().wrapping_add(u32::MAX / 2 - 1));
    }
}

fn deliver_due(st: &mut NetState, now: u32) {
    let mut i = 0;
    while i < st.wire.len() {
        if !time_after(now, st.wire[i].due) {
            i += 1;
            continue;
        }
        let msg = st.wire.remove(i);
        let mut found = false;
        for (slot, mb) in st.boxes.iter_mut().enumerate() {
            let matches = mb.recv_addr == msg.info.target
                || mb.recv_addr_func == Some(msg.info.target);
            if !matches || slot == msg.from {
                continue;
            }
            found = true;
            if mb.inbox.is_some() {
                warn!("sim: mailbox 0x{:03X} already full, message dropped", mb.recv_addr);
                continue;
            }
            mb.inbox = Some((msg.buf.clone(), msg.info));
        }
        if !found {
            warn!("sim: no receiver listening on 0x{:03X}", msg.info.target);
        }
    }
}

/// One endpoint of a [SimNetwork]
pub struct SimTransport {
    state: Arc<Mutex<NetState>>,
    clock: SharedClock,
    slot: usize,
    send_addr: u32,
    recv_addr: u32,
    send_addr_func: Option<u32>,
    tx_delay_ms: u32,
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport")
            .field("send_addr", &self.send_addr)
            .field("recv_addr", &self.recv_addr)
            .finish_non_exhaustive()
    }
}

impl SimTransport {
    /// Delays delivery of everything this endpoint sends by `ms`, simulating
    /// transmission time
    pub fn set_tx_delay(&mut self, ms: u32) {
        self.tx_delay_ms = ms;
    }
}

impl Transport for SimTransport {
    fn send(&mut self, data: &[u8], info: &SduInfo) -> TransportResult<usize> {
        if data.len() > UDS_TP_MTU {
            return Err(TransportError::PayloadTooLarge(data.len()));
        }
        let target = match info.ta_type {
            TargetAddressType::Physical => self.send_addr,
            TargetAddressType::Functional => {
                if data.len() > FUNCTIONAL_MAX {
                    return Err(TransportError::FunctionalSduTooLarge(data.len()));
                }
                self.send_addr_func
                    .ok_or(TransportError::NoFunctionalAddress)?
            }
        };
        let mut st = self.state.lock().unwrap();
        st.wire.push(InFlight {
            from: self.slot,
            buf: data.to_vec(),
            info: SduInfo {
                mtype: Mtype::Diagnostic,
                source: self.recv_addr,
                target,
                ta_type: info.ta_type,
            },
            due: self.clock.millis().wrapping_add(self.tx_delay_ms),
        });
        Ok(data.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> TransportResult<Option<(usize, SduInfo)>> {
        let mut st = self.state.lock().unwrap();
        let now = self.clock.millis();
        deliver_due(&mut st, now);
        match st.boxes[self.slot].inbox.take() {
            Some((data, info)) => {
                if buf.len() < data.len() {
                    return Err(TransportError::PayloadTooLarge(data.len()));
                }
                buf[..data.len()].copy_from_slice(&data);
                Ok(Some((data.len(), info)))
            }
            None => Ok(None),
        }
    }

    fn poll(&mut self) -> TpStatus {
        let mut st = self.state.lock().unwrap();
        let now = self.clock.millis();
        deliver_due(&mut st, now);
        if st.boxes[self.slot].inbox.is_some() {
            TpStatus::RECV_COMPLETE
        } else {
            TpStatus::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimClock;

    fn pair() -> (SimTransport, SimTransport, Arc<SimClock>) {
        let clock = Arc::new(SimClock::new());
        let net = SimNetwork::new(clock.clone());
        let client = net.endpoint(0x7E0, 0x7E8, Some((0x7DF, 0x7DF)));
        let server = net.endpoint(0x7E8, 0x7E0, Some((0x7DF, 0x7DF)));
        (client, server, clock)
    }

    #[test]
    fn physical_sdu_reaches_peer() {
        let (mut client, mut server, _) = pair();
        let info = SduInfo::default();
        client.send(&[0x10, 0x03], &info).unwrap();
        let mut buf = [0u8; 64];
        let (len, rx_info) = server.recv(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], &[0x10, 0x03]);
        assert_eq!(rx_info.ta_type, TargetAddressType::Physical);
        // one SDU per send
        assert!(server.recv(&mut buf).unwrap().is_none());
    }

    #[test]
    fn functional_send_is_single_frame_only() {
        let (mut client, mut server, _) = pair();
        let info = SduInfo {
            ta_type: TargetAddressType::Functional,
            ..Default::default()
        };
        let err = client.send(&[0u8; 8], &info).unwrap_err();
        assert_eq!(err, TransportError::FunctionalSduTooLarge(8));

        client.send(&[0x3E, 0x80], &info).unwrap();
        let mut buf = [0u8; 8];
        let (_, rx_info) = server.recv(&mut buf).unwrap().unwrap();
        assert_eq!(rx_info.ta_type, TargetAddressType::Functional);
    }

    #[test]
    fn tx_delay_holds_delivery_until_clock_advances() {
        let (mut client, mut server, clock) = pair();
        client.set_tx_delay(10);
        client.send(&[0x3E, 0x00], &SduInfo::default()).unwrap();
        let mut buf = [0u8; 8];
        assert!(server.recv(&mut buf).unwrap().is_none());
        clock.advance(10);
        assert!(server.recv(&mut buf).unwrap().is_some());
    }
}
