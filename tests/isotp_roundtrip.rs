//! ISO-TP segmentation compliance over an in-memory CAN bus pair

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use uds_stack::UDS_TP_MTU;
use uds_stack::channel::{CanBus, CanFrame, SduInfo, TpStatus, Transport};
use uds_stack::clock::{Clock, SimClock};
use uds_stack::error::TransportError;
use uds_stack::isotp::{IsoTpAddress, IsoTpSettings, IsoTpTransport};

/// Two-ended in-memory CAN bus that can also record traffic
#[derive(Default)]
struct Wire {
    a_to_b: VecDeque<CanFrame>,
    b_to_a: VecDeque<CanFrame>,
    log: Vec<CanFrame>,
}

struct WireEnd {
    wire: Arc<Mutex<Wire>>,
    is_a: bool,
}

impl CanBus for WireEnd {
    fn send(&mut self, frame: CanFrame) -> Result<(), TransportError> {
        let mut w = self.wire.lock().unwrap();
        w.log.push(frame);
        if self.is_a {
            w.a_to_b.push_back(frame);
        } else {
            w.b_to_a.push_back(frame);
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<CanFrame> {
        let mut w = self.wire.lock().unwrap();
        if self.is_a {
            w.b_to_a.pop_front()
        } else {
            w.a_to_b.pop_front()
        }
    }
}

fn bus_pair() -> (WireEnd, WireEnd, Arc<Mutex<Wire>>) {
    let wire = Arc::new(Mutex::new(Wire::default()));
    (
        WireEnd {
            wire: wire.clone(),
            is_a: true,
        },
        WireEnd {
            wire: wire.clone(),
            is_a: false,
        },
        wire,
    )
}

struct Rig {
    tester: IsoTpTransport<WireEnd>,
    ecu: IsoTpTransport<WireEnd>,
    clock: Arc<SimClock>,
    wire: Arc<Mutex<Wire>>,
}

fn rig(tester_settings: IsoTpSettings, ecu_settings: IsoTpSettings) -> Rig {
    let _ = env_logger::try_init();
    let clock = Arc::new(SimClock::new());
    let (a, b, wire) = bus_pair();
    let tester = IsoTpTransport::new(
        a,
        clock.clone(),
        IsoTpAddress {
            tx_id: 0x7E0,
            rx_id: 0x7E8,
            functional: Some((0x7DF, 0x7DF)),
        },
        tester_settings,
    );
    let ecu = IsoTpTransport::new(
        b,
        clock.clone(),
        IsoTpAddress {
            tx_id: 0x7E8,
            rx_id: 0x7E0,
            functional: Some((0x7DF, 0x7DF)),
        },
        ecu_settings,
    );
    Rig {
        tester,
        ecu,
        clock,
        wire,
    }
}

impl Rig {
    /// Ships one payload tester -> ecu, polling both ends each tick
    fn ship(&mut self, payload: &[u8]) -> Vec<u8> {
        self.tester.send(payload, &SduInfo::default()).unwrap();
        let mut buf = vec![0u8; UDS_TP_MTU];
        for _ in 0..60_000 {
            self.tester.poll();
            self.ecu.poll();
            if let Some((len, _)) = self.ecu.recv(&mut buf).unwrap() {
                return buf[..len].to_vec();
            }
            self.clock.advance(1);
        }
        panic!("payload of {} bytes never arrived", payload.len());
    }
}

#[test]
fn round_trip_payload_sizes_up_to_mtu() {
    let mut rig = rig(IsoTpSettings::default(), IsoTpSettings::default());
    for len in [1usize, 2, 6, 7, 8, 12, 13, 14, 61, 62, 63, 100, 512, 4095] {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        assert_eq!(rig.ship(&payload), payload, "length {len}");
        // both ends settle back to idle
        assert_eq!(rig.tester.poll(), TpStatus::empty());
        assert_eq!(rig.ecu.poll(), TpStatus::empty());
    }
}

#[test]
fn consecutive_frame_sequence_numbers_wrap_without_gap() {
    let mut rig = rig(IsoTpSettings::default(), IsoTpSettings::default());
    // FF carries 6 bytes, so 130 bytes needs 18 CFs - enough to wrap 15 -> 0
    let payload: Vec<u8> = (0..130).map(|i| (i % 251) as u8).collect();
    rig.ship(&payload);

    let observed: Vec<u8> = rig
        .wire
        .lock()
        .unwrap()
        .log
        .iter()
        .filter(|f| f.id() == 0x7E0 && f.data()[0] & 0xF0 == 0x20)
        .map(|f| f.data()[0] & 0x0F)
        .collect();
    let expected: Vec<u8> = (1..=observed.len() as u8).map(|i| i & 0x0F).collect();
    assert_eq!(observed, expected);
}

#[test]
fn receiver_block_size_is_respected() {
    // ecu demands a flow control every 4 CFs
    let ecu_settings = IsoTpSettings {
        block_size: 4,
        ..Default::default()
    };
    let mut rig = rig(IsoTpSettings::default(), ecu_settings);
    let payload: Vec<u8> = (0..100).map(|i| i as u8).collect();
    assert_eq!(rig.ship(&payload), payload);

    // 100 bytes = FF(6) + 14 CFs; FCs after the FF and then every 4 CFs
    let fc_count = rig
        .wire
        .lock()
        .unwrap()
        .log
        .iter()
        .filter(|f| f.id() == 0x7E8 && f.data()[0] & 0xF0 == 0x30)
        .count();
    assert_eq!(fc_count, 1 + 14 / 4);
}

#[test]
fn st_min_slows_the_sender_down() {
    // ecu asks for 2 ms between CFs
    let ecu_settings = IsoTpSettings {
        st_min_us: 2000,
        ..Default::default()
    };
    let mut rig = rig(IsoTpSettings::default(), ecu_settings);
    let start = rig.clock.millis();
    let payload: Vec<u8> = (0..62).map(|i| i as u8).collect();
    assert_eq!(rig.ship(&payload), payload);
    // 8 CFs spaced 2 ms apart cannot complete faster than 14 ms
    assert!(rig.clock.millis() - start >= 14);
}

#[test]
fn responses_flow_back_over_the_same_pair() {
    let mut rig = rig(IsoTpSettings::default(), IsoTpSettings::default());
    let request: Vec<u8> = (0..20).collect();
    assert_eq!(rig.ship(&request), request);

    // now ecu -> tester
    let response: Vec<u8> = (0..300).map(|i| (i % 256) as u8).collect();
    rig.ecu.send(&response, &SduInfo::default()).unwrap();
    let mut buf = vec![0u8; UDS_TP_MTU];
    for _ in 0..60_000 {
        rig.tester.poll();
        rig.ecu.poll();
        if let Some((len, _)) = rig.tester.recv(&mut buf).unwrap() {
            assert_eq!(&buf[..len], &response[..]);
            return;
        }
        rig.clock.advance(1);
    }
    panic!("response never arrived");
}

mod uds_over_isotp {
    use super::*;
    use uds_stack::Nrc;
    use uds_stack::client::{ClientConfig, ClientEvent, ClientEventHandler, ClientState, UdsClient};
    use uds_stack::server::{ServerConfig, ServerEvent, ServiceHandler, ServiceResult, UdsServer};

    #[derive(Default)]
    struct Recorder {
        responses: Vec<Vec<u8>>,
        errors: Vec<uds_stack::ClientError>,
    }

    impl ClientEventHandler for Recorder {
        fn on_event(&mut self, ev: ClientEvent<'_>) {
            match ev {
                ClientEvent::ResponseReceived { response } => {
                    self.responses.push(response.to_vec())
                }
                ClientEvent::Err { error } => self.errors.push(error),
                _ => {}
            }
        }
    }

    struct Ecu;
    impl ServiceHandler for Ecu {
        fn handle(&mut self, ev: ServerEvent<'_>) -> ServiceResult {
            match ev {
                ServerEvent::ReadDataByIdent { did: 0xF190, mut writer } => {
                    // long enough to force segmentation of the response
                    let record: Vec<u8> = (0..200).map(|i| (i % 100) as u8).collect();
                    writer.put(&record)
                }
                ServerEvent::ReadDataByIdent { .. } => Err(Nrc::RequestOutOfRange),
                ServerEvent::WriteDataByIdent { did: 0xF199, data } => {
                    assert_eq!(data.len(), 300);
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    /// A segmented request and a segmented response, end to end through
    /// client, server and both ISO-TP state machines
    #[test]
    fn multi_frame_request_and_response() {
        let _ = env_logger::try_init();
        let clock = Arc::new(SimClock::new());
        let (a, b, _wire) = bus_pair();
        let tester_tp = IsoTpTransport::new(
            a,
            clock.clone(),
            IsoTpAddress {
                tx_id: 0x7E0,
                rx_id: 0x7E8,
                functional: None,
            },
            IsoTpSettings::default(),
        );
        let ecu_tp = IsoTpTransport::new(
            b,
            clock.clone(),
            IsoTpAddress {
                tx_id: 0x7E8,
                rx_id: 0x7E0,
                functional: None,
            },
            IsoTpSettings::default(),
        );

        let mut client = UdsClient::new(
            tester_tp,
            Recorder::default(),
            ClientConfig::default(),
            clock.clone(),
        );
        let mut server = UdsServer::new(ecu_tp, Ecu, ServerConfig::default(), clock.clone());

        let run_until_idle = |client: &mut UdsClient<_, Recorder>,
                              server: &mut UdsServer<_, Ecu>| {
            for _ in 0..10_000 {
                server.poll();
                client.poll();
                if client.state() == ClientState::Idle {
                    return;
                }
                clock.advance(1);
            }
            panic!("request stuck");
        };

        // multi-frame response: 2 (header) + 200 bytes
        client.send_read_data_by_ident(&[0xF190]).unwrap();
        run_until_idle(&mut client, &mut server);

        // multi-frame request: WDBI with a 300 byte record
        let record = vec![0x42u8; 300];
        client.send_write_data_by_ident(0xF199, &record).unwrap();
        run_until_idle(&mut client, &mut server);

        let recorder = client.handler_mut();
        assert_eq!(recorder.errors, vec![]);
        assert_eq!(recorder.responses.len(), 2);

        let rdbi = &recorder.responses[0];
        assert_eq!(&rdbi[..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(rdbi.len(), 3 + 200);

        assert_eq!(recorder.responses[1], vec![0x6E, 0xF1, 0x99]);
    }
}
