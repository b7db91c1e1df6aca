use std::time::{Duration, Instant};

use super::common::*;
use super::test_config;
use camera_grid::{
    codec::CodecTag,
    engine::{
        fake::{AfterLink, Attempt},
        Capabilities,
    },
    recovery::Fault,
    session::{Phase, SessionEventKind},
};

const FRONT: (&str, &str) = ("front", "rtsp://10.0.0.10:554/main");
const BACK: (&str, &str) = ("back", "rtsp://10.0.0.11:554/main");

#[test]
fn test_backoff_doubles_until_playing_then_resets() {
    let config = r#"
[app]
poll_interval_ms = 20

[recovery]
profile = "embedded"

[[streams]]
name = "front"
uri = "rtsp://10.0.0.10:554/main"
"#;
    let mut fixture = TestFixture::new(config);
    fixture
        .engine
        .script("front", [Attempt::Unreachable, Attempt::Unreachable, Attempt::Unreachable]);
    fixture.start();

    let status = fixture.wait_for("front", Duration::from_secs(10), |s| {
        s.phase == Phase::Playing
    });
    assert_eq!(status.connect_attempts, 4);
    assert_eq!(status.playing_cycles, 1);
    assert_eq!(status.backoff, ms(500));

    let report = fixture.supervisor.shutdown();
    assert!(report.all_stopped());

    let events = fixture.drain();
    assert_eq!(backoff_delays(&events, "front"), vec![ms(500), ms(1000), ms(2000)]);
    assert!(faults(&events, "front")
        .iter()
        .all(|f| matches!(f, Fault::ConnectionLost { .. })));
    assert_eq!(fixture.engine.journal("front").connects, 4);
}

#[test]
fn test_runtime_errors_restart_from_base_backoff() {
    let mut fixture = TestFixture::new(&test_config(50, 800, &[FRONT]));
    let flaky = Attempt::video_then_error("H264", ms(60));
    fixture
        .engine
        .script("front", [flaky.clone(), flaky.clone(), flaky]);
    fixture.start();

    fixture.wait_for("front", Duration::from_secs(5), |s| {
        s.playing_cycles == 4 && s.phase == Phase::Playing
    });
    fixture.supervisor.shutdown();

    let events = fixture.drain();
    assert_eq!(backoff_delays(&events, "front"), vec![ms(50); 3]);
    let faults = faults(&events, "front");
    assert_eq!(faults.len(), 3);
    assert!(faults.iter().all(|f| f.kind() == "runtime"));

    let journal = fixture.engine.journal("front");
    assert_eq!(journal.connects, 4);
    assert_eq!(journal.teardowns, 4);
}

#[test]
fn test_streams_recover_independently() {
    let mut fixture = TestFixture::new(&test_config(40, 1000, &[FRONT, BACK]));
    fixture.engine.set_fallback("front", Attempt::Unreachable);
    fixture.start();

    fixture.wait_for("front", Duration::from_secs(5), |s| s.connect_attempts >= 4);
    let back = fixture.wait_for("back", Duration::from_secs(5), |s| {
        s.phase == Phase::Playing
    });
    fixture.supervisor.shutdown();

    assert_eq!(back.connect_attempts, 1);
    assert_eq!(back.playing_cycles, 1);
    assert_eq!(fixture.engine.journal("back").connects, 1);

    let front = fixture.engine.journal("front");
    let gaps: Vec<Duration> = front
        .connect_times
        .windows(2)
        .map(|w| w[1].duration_since(w[0]))
        .collect();
    for (i, gap) in gaps.iter().take(3).enumerate() {
        assert!(*gap >= ms(40 << i), "gap {} was {:?}", i, gap);
    }

    let events = fixture.drain();
    assert!(faults(&events, "back").is_empty());
    assert!(!phases(&events, "front").contains(&Phase::Playing));
}

#[test]
fn test_duplicate_announcement_links_once() {
    let mut fixture = TestFixture::new(&test_config(50, 800, &[FRONT]));
    fixture.engine.script(
        "front",
        [Attempt::Announce {
            outputs: vec![
                Capabilities::rtp("video", "H264"),
                Capabilities::rtp("video", "H264"),
            ],
            then: AfterLink::Hold,
        }],
    );
    fixture.start();

    fixture.wait_for("front", Duration::from_secs(5), |s| s.phase == Phase::Playing);
    // Let the second announcement be handled.
    std::thread::sleep(ms(100));
    let report = fixture.supervisor.shutdown();
    assert_eq!(report.streams[0].connect_attempts, 1);

    let journal = fixture.engine.journal("front");
    assert_eq!(journal.output_links.len(), 1);
    assert_eq!(journal.released_outputs, vec!["recv_rtp_src_1_1001_96".to_string()]);
    assert_eq!(
        journal.stages.iter().filter(|f| *f == "rtph264depay").count(),
        1
    );

    let events = fixture.drain();
    let selected = events
        .iter()
        .filter(|e| matches!(e.kind, SessionEventKind::DecoderSelected { .. }))
        .count();
    assert_eq!(selected, 1);
    assert!(faults(&events, "front").is_empty());
}

#[test]
fn test_audio_track_is_ignored() {
    let mut fixture = TestFixture::new(&test_config(50, 800, &[FRONT]));
    fixture.engine.script(
        "front",
        [Attempt::Announce {
            outputs: vec![
                Capabilities::rtp("audio", "MPEG4-GENERIC"),
                Capabilities::rtp("video", "H265"),
            ],
            then: AfterLink::Hold,
        }],
    );
    fixture.start();

    let status = fixture.wait_for("front", Duration::from_secs(5), |s| {
        s.phase == Phase::Playing
    });
    fixture.supervisor.shutdown();

    assert_eq!(status.decoder.as_deref(), Some("v4l2slh265dec"));
    let journal = fixture.engine.journal("front");
    assert_eq!(journal.released_outputs, vec!["recv_rtp_src_0_1000_96".to_string()]);
    assert_eq!(journal.output_links.len(), 1);
    assert_eq!(journal.output_links[0].0, "recv_rtp_src_1_1001_96");
    assert!(journal.stages.contains(&"rtph265depay".to_string()));

    let events = fixture.drain();
    assert!(events.iter().any(|e| e.kind
        == SessionEventKind::DecoderSelected {
            codec: CodecTag::H265,
            decoder: "v4l2slh265dec".to_string(),
        }));
}

#[test]
fn test_shutdown_reports_every_started_stream() {
    let mut config = test_config(8000, 8000, &[FRONT, BACK]);
    config.push_str("\n[[streams]]\nname = \"side\"\nuri = \"rtsp://10.0.0.12/main\"\nenabled = false\n");
    let mut fixture = TestFixture::new(&config);
    fixture.engine.set_fallback("back", Attempt::Unreachable);
    fixture.start();

    fixture.wait_for("front", Duration::from_secs(5), |s| s.phase == Phase::Playing);
    fixture.wait_for("back", Duration::from_secs(5), |s| s.phase == Phase::Backoff);

    let started = Instant::now();
    let report = fixture.supervisor.shutdown();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(report.all_stopped());
    assert!(!report.timed_out);
    let names: Vec<&str> = report.streams.iter().map(|s| s.stream.as_str()).collect();
    assert_eq!(names, vec!["front", "back"]);
    assert_eq!(report.streams[0].playing_cycles, 1);
    assert_eq!(report.streams[1].playing_cycles, 0);
    assert_eq!(fixture.engine.journal("side").connects, 0);
}
