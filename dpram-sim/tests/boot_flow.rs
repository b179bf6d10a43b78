//! End-to-end boot flows against the scripted peer.
//!
//! The simulation is deterministic (one peer tick per delay call), so these
//! tests pin exact poll counts next to the protocol outcomes.

use dpram_link::boot::map::FRAME_SIZE_LIMIT;
use dpram_link::boot::DUMP_END_TAG;
use dpram_link::mailbox::{CommandInbox, InitEndSignal};
use dpram_link::{BootError, Phase};
use dpram_sim::{PeerConfig, Sim, SimWindow};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn fifty_kb_image_splits_into_two_frames() {
    init_logs();
    let inbox = CommandInbox::new();
    let init_end = InitEndSignal::new();
    let mut win = SimWindow::new();
    let sim = Sim::with_download_peer(win.region(), PeerConfig::default(), &inbox, &init_end);
    let mut boot = sim.boot().unwrap();

    let image = pattern(50_000);
    boot.prepare_download().unwrap();
    boot.download_image(&image, 0x60, 1).unwrap();
    assert_eq!(boot.phase(), Phase::Complete);

    // Window-sized first frame, remainder second, final tag forced to 0.
    let chunks = sim.chunks();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].payload, image[..FRAME_SIZE_LIMIT]);
    assert_eq!(chunks[0].tag, 0x60);
    assert_eq!(chunks[0].count, 1);
    assert_eq!(chunks[1].payload, image[FRAME_SIZE_LIMIT..]);
    assert_eq!(chunks[1].tag, 0);
    assert_eq!(chunks[1].count, 2);
    assert_eq!(sim.acks(), 2);

    // Three 10 ms polls to catch the announce, then two per ack round trip.
    assert_eq!(sim.delay_calls(), 7);
    assert_eq!(sim.delay_total_ns(), 7 * 10_000_000);
}

#[test]
fn full_download_chain_hands_the_window_to_ipc() {
    init_logs();
    let inbox = CommandInbox::new();
    let init_end = InitEndSignal::new();
    let mut win = SimWindow::new();
    let sim = Sim::with_download_peer(win.region(), PeerConfig::default(), &inbox, &init_end);
    let mut boot = sim.boot().unwrap();

    let image = pattern(50_000);
    let nv = pattern(16_000);

    boot.prepare_download().unwrap();
    boot.download_image(&image, 0x60, 1).unwrap();
    boot.load_nv(&nv, 0x33, 1).unwrap();
    boot.start_boot().unwrap();
    assert_eq!(boot.phase(), Phase::BootStartPostProcessing);
    boot.send_init_end().unwrap();
    boot.wait_init_end().unwrap();
    assert_eq!(boot.phase(), Phase::Complete);

    // NV keeps its own tag and counter even on the final frame.
    let chunks = sim.chunks();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[2].payload, nv);
    assert_eq!(chunks[2].tag, 0x33);
    assert_eq!(chunks[2].count, 1);

    let view = boot.into_ipc_view().unwrap();
    view.reset().unwrap();
    assert!(view.is_ready().unwrap());
    assert_eq!(&win.bytes()[0..2], &[0xAA, 0x00]);
    assert_eq!(&win.bytes()[2..4], &[0x01, 0x00]);
}

#[test]
fn dump_upload_round_trip() {
    init_logs();
    let inbox = CommandInbox::new();
    let init_end = InitEndSignal::new();
    let mut win = SimWindow::new();
    let frames = vec![(pattern(100), 0x0001), (pattern(60), DUMP_END_TAG)];
    let sim = Sim::with_dump_peer(
        win.region(),
        frames,
        PeerConfig::default(),
        &inbox,
        &init_end,
    );
    let mut boot = sim.boot().unwrap();

    boot.upload_dump_start().unwrap();

    let mut buf = [0u8; 256];
    let first = boot.upload_dump_frame(&mut buf).unwrap();
    assert_eq!(first.len, 100);
    assert_eq!(first.tag, 0x0001);
    assert_eq!(first.count, 1);
    assert!(!first.last);
    assert_eq!(&buf[..100], &pattern(100)[..]);

    let second = boot.upload_dump_frame(&mut buf).unwrap();
    assert_eq!(second.len, 60);
    assert_eq!(second.tag, DUMP_END_TAG);
    assert_eq!(second.count, 2);
    assert!(second.last);
    assert_eq!(&buf[..60], &pattern(60)[..]);

    // The final frame re-enables the line and completes the sequence.
    assert!(sim.line_enabled());
    assert_eq!(boot.phase(), Phase::Complete);

    // 1 ms handshake polls: three to the announce, two per served frame.
    assert_eq!(sim.delay_calls(), 7);
    assert_eq!(sim.delay_total_ns(), 7 * 1_000_000);
}

#[test]
fn single_frame_dump_completes_immediately() {
    init_logs();
    let inbox = CommandInbox::new();
    let init_end = InitEndSignal::new();
    let mut win = SimWindow::new();
    let frames = vec![(pattern(100), DUMP_END_TAG)];
    let sim = Sim::with_dump_peer(
        win.region(),
        frames,
        PeerConfig::default(),
        &inbox,
        &init_end,
    );
    let mut boot = sim.boot().unwrap();

    boot.upload_dump_start().unwrap();
    let mut buf = [0u8; 128];
    let frame = boot.upload_dump_frame(&mut buf).unwrap();

    assert_eq!(frame.len, 100);
    assert_eq!(frame.tag, DUMP_END_TAG);
    assert_eq!(frame.count, 1);
    assert!(frame.last);
    assert_eq!(&buf[..100], &pattern(100)[..]);
    assert!(sim.line_enabled());
    assert_eq!(boot.phase(), Phase::Complete);
}

#[test]
fn silent_peer_times_out_the_prep_poll() {
    init_logs();
    let inbox = CommandInbox::new();
    let init_end = InitEndSignal::new();
    let mut win = SimWindow::new();
    let cfg = PeerConfig {
        silent: true,
        ..PeerConfig::default()
    };
    let sim = Sim::with_download_peer(win.region(), cfg, &inbox, &init_end);
    let mut boot = sim.boot().unwrap();

    assert_eq!(
        boot.prepare_download(),
        Err(BootError::Timeout {
            phase: Phase::DownloadPrep
        })
    );
    assert_eq!(boot.phase(), Phase::Failed);
    assert_eq!(sim.delay_calls(), 200);
    assert_eq!(sim.delay_total_ns(), 200 * 10_000_000);
}

#[test]
fn download_stalls_when_the_peer_stops_acking() {
    init_logs();
    let inbox = CommandInbox::new();
    let init_end = InitEndSignal::new();
    let mut win = SimWindow::new();
    let cfg = PeerConfig {
        max_acks: Some(1),
        ..PeerConfig::default()
    };
    let sim = Sim::with_download_peer(win.region(), cfg, &inbox, &init_end);
    let mut boot = sim.boot().unwrap();

    let image = pattern(50_000);
    boot.prepare_download().unwrap();
    assert_eq!(
        boot.download_image(&image, 0x60, 1),
        Err(BootError::Timeout {
            phase: Phase::Downloading
        })
    );
    assert_eq!(boot.phase(), Phase::Failed);

    // The one ack pulled in the second frame; its ack never came.
    assert_eq!(sim.chunks().len(), 2);
    assert_eq!(sim.acks(), 1);
    assert_eq!(sim.delay_calls(), 3 + 2000);
}

#[test]
fn desync_ack_fails_the_transfer() {
    init_logs();
    let inbox = CommandInbox::new();
    let init_end = InitEndSignal::new();
    let mut win = SimWindow::new();
    let cfg = PeerConfig {
        ack_code: 0x9999,
        ..PeerConfig::default()
    };
    let sim = Sim::with_download_peer(win.region(), cfg, &inbox, &init_end);
    let mut boot = sim.boot().unwrap();

    let image = pattern(1_000);
    boot.prepare_download().unwrap();
    assert_eq!(
        boot.download_image(&image, 0x60, 1),
        Err(BootError::UnexpectedCode {
            phase: Phase::Downloading,
            code: 0x9999
        })
    );
    assert_eq!(boot.phase(), Phase::Failed);
}
