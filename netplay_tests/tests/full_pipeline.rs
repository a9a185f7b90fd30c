// End-to-end integration tests for the netplay pipeline.
//
// Each test starts a real `NetplayService` on localhost, connects real
// `NetplayClient`s (via `TestEmulator`), and verifies a full path:
// host upload → joiner download, registration → UDP lockstep → identical
// state, input delay, desync reporting, keepalive expiry, and port reuse
// after a player leaves.
//
// These tests exercise the same code paths as a live session; the only
// test-specific code is the synchronous polling wrappers in `TestEmulator`.

use std::thread;

use netplay_protocol::udp::{STATUS_DESYNC, disconnect_bit};
use netplay_protocol::{CoreSettings, PlayerNumber, RegistrationId};
use netplay_server::{NetplayEvent, ServerConfig, ServiceEvent};
use netplay_tests::{TEST_PLUGIN, TestEmulator, TestServer, cp0_block, scripted_keys};

fn p(n: u8) -> PlayerNumber {
    PlayerNumber::new(n).unwrap()
}

#[test]
fn host_setup_reaches_joiner() {
    let server = TestServer::start(ServerConfig::default());
    let addr = server.addr;

    // The joiner asks first; its downloads block until the host uploads.
    let joiner = thread::spawn(move || {
        let mut joiner = TestEmulator::connect_unregistered(addr, RegistrationId(2));
        let settings = joiner.client().receive_settings().unwrap();
        let video = joiner.client().receive_video_settings().unwrap();
        let save = joiner.client().receive_file("MARIO.eep").unwrap();
        (settings, video, save)
    });

    let settings = CoreSettings {
        count_per_op: 2,
        count_per_op_denom_pot: 0,
        disable_extra_mem: 1,
        si_dma_duration: -1,
        emu_mode: 2,
    };
    let mut host = TestEmulator::connect_unregistered(addr, RegistrationId(1));
    host.client().send_file("MARIO.eep", &[0x5A; 2048]).unwrap();
    host.client().send_video_settings("[Video-GLideN64]\nMultiSampling=0").unwrap();
    host.client().send_settings(settings).unwrap();

    let (got_settings, got_video, got_save) = joiner.join().unwrap();
    assert_eq!(got_settings, settings);
    assert_eq!(got_video, "[Video-GLideN64]\nMultiSampling=0");
    assert_eq!(got_save, vec![0x5A; 2048]);

    server.stop();
}

#[test]
fn registration_table_is_shared() {
    let server = TestServer::start(ServerConfig::default());
    let _a = TestEmulator::connect(server.addr, p(0), RegistrationId(11));
    let _b = TestEmulator::connect(server.addr, p(2), RegistrationId(33));

    let mut observer = TestEmulator::connect_unregistered(server.addr, RegistrationId(99));
    let refused = observer
        .client()
        .register_player(p(0), TEST_PLUGIN, 0, RegistrationId(99))
        .unwrap();
    assert!(!refused.accepted);

    let table = observer.client().registrations().unwrap();
    assert_eq!(table[0].map(|d| d.registration), Some(RegistrationId(11)));
    assert!(table[1].is_none());
    assert_eq!(table[2].map(|d| d.registration), Some(RegistrationId(33)));
    assert!(table[3].is_none());

    server.stop();
}

#[test]
fn two_players_stay_in_lockstep() {
    let server = TestServer::start(ServerConfig::default());
    let players = [p(0), p(1)];
    let mut a = TestEmulator::connect(server.addr, p(0), RegistrationId(1));
    let mut b = TestEmulator::connect(server.addr, p(1), RegistrationId(2));

    for _ in 0..40 {
        a.step(&players);
        b.step(&players);
    }

    assert_eq!(a.frame(), 40);
    assert_eq!(a.state(), b.state());
    for player in players {
        let seen_by_a: Vec<_> = a.inputs(player).range(..40).collect();
        let seen_by_b: Vec<_> = b.inputs(player).range(..40).collect();
        assert_eq!(seen_by_a, seen_by_b, "{player} inputs differ");
    }

    // A spectator joining late sees the same history.
    let mut spectator = TestEmulator::connect_unregistered(server.addr, RegistrationId(3));
    for _ in 0..40 {
        spectator.step(&players);
    }
    assert_eq!(spectator.state(), a.state());

    assert!(server.stop().is_empty());
}

#[test]
fn input_delay_shifts_inputs_by_configured_frames() {
    const DELAY: u32 = 2;
    const FRAMES: u32 = 30;
    let config = ServerConfig {
        input_delay: [Some(DELAY); 4],
        ..ServerConfig::default()
    };
    let server = TestServer::start(config);
    let players = [p(0), p(1)];
    let addr = server.addr;

    // Delayed players are never synthesized for, so each emulator must run
    // on its own thread and wait for the other's real inputs.
    let run = move |player: PlayerNumber, registration: u32| {
        thread::spawn(move || {
            let mut emulator = TestEmulator::connect(addr, player, RegistrationId(registration));
            for _ in 0..FRAMES {
                emulator.step(&players);
            }
            emulator
        })
    };
    let a = run(p(0), 1);
    let b = run(p(1), 2);
    let a = a.join().unwrap();
    let b = b.join().unwrap();

    assert_eq!(a.state(), b.state());
    for player in players {
        let inputs = a.inputs(player);
        for frame in 0..FRAMES {
            // Frames before the delay are backfilled from the first input.
            let sampled_on = frame.saturating_sub(DELAY);
            assert_eq!(
                inputs[&frame].keys,
                scripted_keys(player, sampled_on),
                "{player} frame {frame}"
            );
        }
    }

    server.stop();
}

#[test]
fn diverging_snapshots_flag_desync() {
    let server = TestServer::start(ServerConfig::default());
    let players = [p(0), p(1)];
    let mut a = TestEmulator::connect(server.addr, p(0), RegistrationId(1));
    let mut b = TestEmulator::connect(server.addr, p(1), RegistrationId(2));
    for _ in 0..5 {
        a.step(&players);
        b.step(&players);
    }

    // Matching snapshots are fine.
    a.send_cp0(1);
    b.send_cp0(1);
    // Then b diverges.
    a.send_cp0(2);
    b.send_cp0_block(2, cp0_block(!b.state()));

    let event = server.wait_for_event("desync", |e| {
        matches!(e, ServiceEvent::Netplay(NetplayEvent::Desync { .. }))
    });
    assert_eq!(
        event,
        ServiceEvent::Netplay(NetplayEvent::Desync { vi_count: 2 })
    );

    let status = a.poll_until_status(p(1), |status| status & STATUS_DESYNC != 0);
    assert_eq!(status & STATUS_DESYNC, STATUS_DESYNC);

    server.stop();
}

#[test]
fn silent_player_is_dropped_after_keepalive_expiry() {
    let config = ServerConfig {
        tick_interval_ms: 20,
        keepalive_threshold: 5,
        ..ServerConfig::default()
    };
    let server = TestServer::start(config);
    let players = [p(0), p(1)];
    let mut a = TestEmulator::connect(server.addr, p(0), RegistrationId(1));
    let mut b = TestEmulator::connect(server.addr, p(1), RegistrationId(2));
    a.step(&players);
    b.step(&players);

    // The first snapshot starts connection checks. `b` then goes quiet while
    // `a` keeps polling (which keeps `a` alive).
    a.send_cp0(0);
    drop(b);
    let status = a.poll_until_status(p(1), |status| status & disconnect_bit(p(1)) != 0);
    assert_eq!(status & disconnect_bit(p(0)), 0);

    let event = server.wait_for_event("disconnect", |e| {
        matches!(e, ServiceEvent::Netplay(NetplayEvent::PlayerDisconnected { .. }))
    });
    assert_eq!(
        event,
        ServiceEvent::Netplay(NetplayEvent::PlayerDisconnected {
            player: p(1),
            registration: RegistrationId(2),
        })
    );

    // The expired player's port is free on the TCP side too.
    let table = a.client().registrations().unwrap();
    assert!(table[1].is_none());
    let replacement = TestEmulator::connect(server.addr, p(1), RegistrationId(3));
    assert_eq!(replacement.player, Some(p(1)));

    server.stop();
}

#[test]
fn disconnect_notice_frees_port_for_new_player() {
    let server = TestServer::start(ServerConfig::default());
    let mut peer = TestEmulator::connect(server.addr, p(0), RegistrationId(1));
    peer.step(&[p(0)]);
    let mut a = TestEmulator::connect(server.addr, p(3), RegistrationId(40));
    a.client().disconnect(RegistrationId(40)).unwrap();

    server.wait_for_event("disconnect", |e| {
        matches!(e, ServiceEvent::Netplay(NetplayEvent::PlayerDisconnected { .. }))
    });
    peer.poll_until_status(p(0), |status| status & disconnect_bit(p(3)) != 0);

    let replacement = TestEmulator::connect(server.addr, p(3), RegistrationId(41));
    assert_eq!(replacement.player, Some(p(3)));
    let table = peer.client().registrations().unwrap();
    assert_eq!(table[3].map(|d| d.registration), Some(RegistrationId(41)));

    // Peers stop seeing the port as disconnected once it is taken again.
    let status = peer.poll_until_status(p(0), |status| status & disconnect_bit(p(3)) == 0);
    assert_eq!(status, 0);

    server.stop();
}
