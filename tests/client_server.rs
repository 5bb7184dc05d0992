//! Client and server talking over the mock network: timing, RCRRP, option
//! handling

use std::sync::Arc;

use uds_stack::client::{
    ClientConfig, ClientEvent, ClientEventHandler, ClientOptions, ClientState, UdsClient,
};
use uds_stack::clock::SimClock;
use uds_stack::error::ClientError;
use uds_stack::server::{ServerConfig, ServerEvent, ServiceHandler, ServiceResult, UdsServer};
use uds_stack::sim::{SimNetwork, SimTransport};
use uds_stack::Nrc;

/// Records everything the client reports
#[derive(Default)]
struct Recorder {
    responses: Vec<Vec<u8>>,
    errors: Vec<ClientError>,
    send_completes: u32,
}

impl ClientEventHandler for Recorder {
    fn on_event(&mut self, ev: ClientEvent<'_>) {
        match ev {
            ClientEvent::ResponseReceived { response } => self.responses.push(response.to_vec()),
            ClientEvent::Err { error } => self.errors.push(error),
            ClientEvent::SendComplete => self.send_completes += 1,
            ClientEvent::Poll | ClientEvent::Idle => {}
        }
    }
}

/// Server handler used by most tests
#[derive(Default)]
struct Ecu {
    /// 0x31 returns 0x78 this many times before succeeding
    routine_rcrrp: u8,
    routine_nrc: Option<Nrc>,
}

impl ServiceHandler for Ecu {
    fn handle(&mut self, ev: ServerEvent<'_>) -> ServiceResult {
        match ev {
            ServerEvent::RoutineCtrl { .. } => {
                if self.routine_rcrrp > 0 {
                    self.routine_rcrrp -= 1;
                    return Err(Nrc::RequestCorrectlyReceivedResponsePending);
                }
                match self.routine_nrc {
                    Some(nrc) => Err(nrc),
                    None => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }
}

struct Rig {
    client: UdsClient<SimTransport, Recorder>,
    server: UdsServer<SimTransport, Ecu>,
    clock: Arc<SimClock>,
}

fn rig(ecu: Ecu, client_cfg: ClientConfig, server_cfg: ServerConfig) -> Rig {
    let _ = env_logger::try_init();
    let clock = Arc::new(SimClock::new());
    let net = SimNetwork::new(clock.clone());
    let tester_tp = net.endpoint(0x7E0, 0x7E8, Some((0x7DF, 0x7DF)));
    let ecu_tp = net.endpoint(0x7E8, 0x7E0, Some((0x7DF, 0x7DF)));
    Rig {
        client: UdsClient::new(tester_tp, Recorder::default(), client_cfg, clock.clone()),
        server: UdsServer::new(ecu_tp, ecu, server_cfg, clock.clone()),
        clock,
    }
}

impl Rig {
    /// Advances both state machines one millisecond per step
    fn run(&mut self, ms: u32) {
        for _ in 0..ms {
            self.server.poll();
            self.client.poll();
            self.clock.advance(1);
        }
    }

    fn run_until_idle(&mut self, max_ms: u32) {
        for _ in 0..max_ms {
            self.server.poll();
            self.client.poll();
            if self.client.state() == ClientState::Idle {
                return;
            }
            self.clock.advance(1);
        }
        panic!("client never returned to idle");
    }
}

#[test]
fn diag_sess_ctrl_adopts_server_timings() {
    let mut rig = rig(Ecu::default(), ClientConfig::default(), ServerConfig::default());
    rig.client.send_diag_sess_ctrl(0x03).unwrap();
    rig.run_until_idle(100);

    let recorder = rig.client.handler_mut();
    assert_eq!(recorder.errors, vec![]);
    assert_eq!(recorder.responses, vec![vec![0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]]);
    // adopted: P2 = 50, P2* = 500 * 10
    assert_eq!(rig.client.p2_ms(), 50);
    assert_eq!(rig.client.p2_star_ms(), 5000);
}

#[test]
fn ignore_srv_timings_keeps_client_budgets() {
    let mut rig = rig(Ecu::default(), ClientConfig::default(), ServerConfig::default());
    rig.client.options = ClientOptions::IGNORE_SRV_TIMINGS;
    rig.client.send_diag_sess_ctrl(0x03).unwrap();
    rig.run_until_idle(100);
    assert_eq!(rig.client.p2_ms(), 150);
    assert_eq!(rig.client.p2_star_ms(), 1500);
}

#[test]
fn rcrrp_extends_the_response_window() {
    // spec scenario: handler answers 0x78 twice, then positive. Client
    // P2 = 150 ms would expire long before the ~3000 ms the server takes;
    // each 0x78 re-arms the client to P2* = 1500 ms.
    let mut rig = rig(
        Ecu {
            routine_rcrrp: 2,
            ..Default::default()
        },
        ClientConfig {
            p2_ms: 150,
            p2_star_ms: 1500,
        },
        ServerConfig::default(),
    );
    rig.client
        .send_routine_ctrl(0x01, 0x1234, &[])
        .unwrap();
    rig.run_until_idle(4000);

    let recorder = rig.client.handler_mut();
    assert_eq!(recorder.errors, vec![]);
    // exactly one terminal response is delivered; the 0x78s are consumed
    // internally
    assert_eq!(recorder.responses, vec![vec![0x71, 0x01, 0x12, 0x34]]);
}

#[test]
fn response_timeout_surfaces_err() {
    let mut rig = rig(Ecu::default(), ClientConfig::default(), ServerConfig::default());
    rig.client.send_tester_present().unwrap();
    // drive only the client; the server never answers
    for _ in 0..200 {
        rig.client.poll();
        rig.clock.advance(1);
    }
    assert_eq!(rig.client.state(), ClientState::Idle);
    assert_eq!(rig.client.handler_mut().errors, vec![ClientError::Timeout]);
    assert_eq!(rig.client.last_error(), Some(&ClientError::Timeout));
}

#[test]
fn second_request_while_busy_is_rejected() {
    let mut rig = rig(Ecu::default(), ClientConfig::default(), ServerConfig::default());
    rig.client.send_tester_present().unwrap();
    assert_eq!(
        rig.client.send_tester_present().unwrap_err(),
        ClientError::Busy
    );
    rig.run_until_idle(100);
    // idle again: accepted
    rig.client.send_tester_present().unwrap();
}

#[test]
fn suppressed_positive_response_goes_straight_to_idle() {
    let mut rig = rig(Ecu::default(), ClientConfig::default(), ServerConfig::default());
    rig.client.options = ClientOptions::SUPPRESS_POS_RESP;
    rig.client.send_tester_present().unwrap();
    rig.run(300);

    let recorder = rig.client.handler_mut();
    assert_eq!(recorder.responses, vec![] as Vec<Vec<u8>>);
    assert_eq!(recorder.errors, vec![]);
    assert_eq!(recorder.send_completes, 1);
    assert_eq!(rig.client.state(), ClientState::Idle);
}

#[test]
fn functional_request_expects_no_response() {
    let mut rig = rig(Ecu::default(), ClientConfig::default(), ServerConfig::default());
    rig.client.options = ClientOptions::FUNCTIONAL;
    rig.client.send_tester_present().unwrap();
    rig.run(50);
    assert_eq!(rig.client.state(), ClientState::Idle);
    assert_eq!(rig.client.handler_mut().errors, vec![]);
    // the server still saw and answered the functional request physically,
    // but the client was no longer waiting
    assert_eq!(rig.client.handler_mut().responses, vec![] as Vec<Vec<u8>>);
}

#[test]
fn negative_response_is_an_event_by_default() {
    let mut rig = rig(
        Ecu {
            routine_nrc: Some(Nrc::ConditionsNotCorrect),
            ..Default::default()
        },
        ClientConfig::default(),
        ServerConfig::default(),
    );
    rig.client.send_routine_ctrl(0x01, 0x1234, &[]).unwrap();
    rig.run_until_idle(100);
    let recorder = rig.client.handler_mut();
    assert_eq!(recorder.errors, vec![]);
    assert_eq!(recorder.responses, vec![vec![0x7F, 0x31, 0x22]]);
}

#[test]
fn negative_response_as_error_when_opted_in() {
    let mut rig = rig(
        Ecu {
            routine_nrc: Some(Nrc::ConditionsNotCorrect),
            ..Default::default()
        },
        ClientConfig::default(),
        ServerConfig::default(),
    );
    rig.client.options = ClientOptions::NEG_RESP_IS_ERR;
    rig.client.send_routine_ctrl(0x01, 0x1234, &[]).unwrap();
    rig.run_until_idle(100);
    let recorder = rig.client.handler_mut();
    assert_eq!(recorder.responses, vec![] as Vec<Vec<u8>>);
    assert_eq!(
        recorder.errors,
        vec![ClientError::NegativeResponse(Nrc::ConditionsNotCorrect)]
    );
}

#[test]
fn ecu_reset_response_validates_subfunction_echo() {
    let mut rig = rig(Ecu::default(), ClientConfig::default(), ServerConfig::default());
    rig.client.send_ecu_reset(0x01).unwrap();
    rig.run_until_idle(100);
    let recorder = rig.client.handler_mut();
    assert_eq!(recorder.errors, vec![]);
    assert_eq!(recorder.responses, vec![vec![0x51, 0x01]]);
}

#[test]
fn download_sequence_end_to_end() {
    struct FlashEcu {
        flash: Vec<u8>,
    }
    impl ServiceHandler for FlashEcu {
        fn handle(&mut self, ev: ServerEvent<'_>) -> ServiceResult {
            match ev {
                ServerEvent::RequestDownload { max_block_len, .. } => {
                    *max_block_len = 10;
                    Ok(())
                }
                ServerEvent::TransferData { data, .. } => {
                    self.flash.extend_from_slice(data);
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    let _ = env_logger::try_init();
    let clock = Arc::new(SimClock::new());
    let net = SimNetwork::new(clock.clone());
    let tester_tp = net.endpoint(0x7E0, 0x7E8, None);
    let ecu_tp = net.endpoint(0x7E8, 0x7E0, None);
    let mut client = UdsClient::new(
        tester_tp,
        Recorder::default(),
        ClientConfig::default(),
        clock.clone(),
    );
    let mut server = UdsServer::new(
        ecu_tp,
        FlashEcu { flash: Vec::new() },
        ServerConfig::default(),
        clock.clone(),
    );

    let payload: Vec<u8> = (0..20).collect();

    let run_until_idle = |client: &mut UdsClient<_, _>, server: &mut UdsServer<_, _>| {
        for _ in 0..1000 {
            server.poll();
            client.poll();
            if client.state() == ClientState::Idle {
                return;
            }
            clock.advance(1);
        }
        panic!("request stuck");
    };

    client.send_request_download(0x00, 0x22, 0x1000, payload.len()).unwrap();
    run_until_idle(&mut client, &mut server);
    let block_len = uds_stack::client::unpack_request_download_response(
        client.handler_mut().responses.last().unwrap(),
    )
    .unwrap();
    assert_eq!(block_len, 10);

    // block length includes the two header bytes
    let chunk = block_len - 2;
    for (i, data) in payload.chunks(chunk).enumerate() {
        client
            .send_transfer_data((i + 1) as u8, block_len as u16, data)
            .unwrap();
        run_until_idle(&mut client, &mut server);
    }
    client.send_request_transfer_exit().unwrap();
    run_until_idle(&mut client, &mut server);

    assert_eq!(client.handler_mut().errors, vec![]);
    assert_eq!(server.handler_mut().flash, payload);
    assert!(!server.transfer_active());
}
