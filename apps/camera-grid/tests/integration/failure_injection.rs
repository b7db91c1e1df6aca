use std::time::{Duration, Instant};

use super::common::*;
use super::test_config;
use camera_grid::{
    chain::AssemblyError,
    codec::CodecTag,
    engine::{
        fake::{AfterLink, Attempt},
        Capabilities, EngineError,
    },
    recovery::Fault,
    session::Phase,
};

const CAM: (&str, &str) = ("cam", "rtsp://192.168.1.20/stream1");

#[test]
fn test_shutdown_interrupts_long_backoff() {
    let mut fixture = TestFixture::new(&test_config(8000, 8000, &[CAM]));
    fixture.engine.set_fallback("cam", Attempt::Unreachable);
    fixture.start();

    fixture.wait_for("cam", Duration::from_secs(5), |s| s.phase == Phase::Backoff);

    let started = Instant::now();
    let report = fixture.supervisor.shutdown();
    // One poll interval plus scheduling slack.
    assert!(started.elapsed() < ms(500), "took {:?}", started.elapsed());
    assert!(report.all_stopped());
    assert_eq!(report.streams[0].connect_attempts, 1);

    let events = fixture.drain();
    assert_eq!(backoff_delays(&events, "cam"), vec![ms(8000)]);
    assert_eq!(phases(&events, "cam").last(), Some(&Phase::Stopped));
    assert_eq!(fixture.engine.journal("cam").teardowns, 1);
}

#[test]
fn test_refused_connection_is_retried() {
    let mut fixture = TestFixture::new(&test_config(30, 500, &[CAM]));
    fixture
        .engine
        .script("cam", [Attempt::Refused, Attempt::Refused]);
    fixture.start();

    fixture.wait_for("cam", Duration::from_secs(5), |s| s.phase == Phase::Playing);
    fixture.supervisor.shutdown();

    let events = fixture.drain();
    let faults = faults(&events, "cam");
    assert_eq!(faults.len(), 2);
    assert!(faults.iter().all(|f| matches!(
        f,
        Fault::Connection(EngineError::PipelineCreation { .. })
    )));
    assert_eq!(backoff_delays(&events, "cam"), vec![ms(30), ms(60)]);
}

#[test]
fn test_unsupported_codec_times_out_negotiation() {
    let mut fixture = TestFixture::new(&test_config(30, 500, &[CAM]));
    fixture.engine.script(
        "cam",
        [Attempt::Announce {
            outputs: vec![Capabilities::rtp("video", "MP4V-ES")],
            then: AfterLink::Hold,
        }],
    );
    fixture.start();

    let status = fixture.wait_for("cam", Duration::from_secs(5), |s| {
        s.phase == Phase::Playing
    });
    fixture.supervisor.shutdown();

    assert_eq!(status.connect_attempts, 2);
    assert_eq!(
        status.last_fault,
        Some(Fault::NegotiationTimeout(Duration::from_secs(1)))
    );

    let journal = fixture.engine.journal("cam");
    assert_eq!(journal.released_outputs, vec!["recv_rtp_src_0_1000_96".to_string()]);
    assert_eq!(journal.output_links.len(), 1);

    let events = fixture.drain();
    let phases = phases(&events, "cam");
    let first_play = phases.iter().position(|p| *p == Phase::Playing);
    let first_backoff = phases.iter().position(|p| *p == Phase::Backoff);
    assert!(first_backoff.is_some());
    assert!(first_backoff < first_play);
    assert!(!phases[..first_backoff.unwrap_or(0)].contains(&Phase::Assembling));
}

#[test]
fn test_silent_source_times_out_negotiation() {
    let mut fixture = TestFixture::new(&test_config(30, 500, &[CAM]));
    fixture.engine.script("cam", [Attempt::Silent]);
    fixture.start();

    let status = fixture.wait_for("cam", Duration::from_secs(5), |s| {
        s.phase == Phase::Playing
    });
    fixture.supervisor.shutdown();

    assert_eq!(status.connect_attempts, 2);
    let events = fixture.drain();
    assert_eq!(
        faults(&events, "cam"),
        vec![Fault::NegotiationTimeout(Duration::from_secs(1))]
    );
}

#[test]
fn test_missing_decoders_never_play() {
    let mut config = test_config(30, 500, &[CAM]);
    config.push_str("\n[decode]\nh264 = [\"decA\", \"decB\"]\n");
    let mut fixture = TestFixture::new(&config);
    fixture.engine.mark_unavailable("decA");
    fixture.engine.mark_unavailable("decB");
    fixture.start();

    let status = fixture.wait_for("cam", Duration::from_secs(5), |s| s.connect_attempts >= 3);
    fixture.supervisor.shutdown();

    assert_eq!(status.playing_cycles, 0);
    assert_eq!(
        status.last_fault,
        Some(Fault::Assembly(AssemblyError::NoDecoder {
            codec: CodecTag::H264,
            candidates: vec!["decA".to_string(), "decB".to_string()],
        }))
    );

    let events = fixture.drain();
    assert!(!phases(&events, "cam").contains(&Phase::Playing));
    assert!(faults(&events, "cam").iter().all(|f| f.kind() == "assembly"));
    assert!(fixture.engine.journal("cam").output_links.is_empty());
}
