mod common;

use std::sync::Arc;
use std::time::Duration;

use tapecut_core::{PreviewConfig, PreviewResult, PreviewSlot};
use tapecut_media::{MediaSession, PreviewService};

const WAIT: Duration = Duration::from_secs(20);

fn next_for(service: &PreviewService, slot: PreviewSlot) -> PreviewResult {
    loop {
        let result = service.results().recv_timeout(WAIT).expect("preview result");
        if result.ticket().slot == slot {
            return result;
        }
    }
}

#[test]
fn frames_are_letterboxed_to_preview_size() {
    let fx = common::tape(4.0);
    let config = PreviewConfig::default();
    let session = Arc::new(MediaSession::open_with(&fx.path, &config).unwrap());
    let service = PreviewService::new(&config);

    let ticket = service.request_preview(&session, 1.0, PreviewSlot::Start);
    let result = service.results().recv_timeout(WAIT).unwrap();
    assert_eq!(result.ticket(), ticket);

    let frame = result.frame().expect("frame");
    assert_eq!((frame.width, frame.height), config.preview_size());
    assert!(frame.is_well_formed());
    // 4:3 source: the left edge is pillarbox.
    assert_eq!(&frame.data[..4], &[0, 0, 0, 255]);
}

#[test]
fn out_of_range_request_reports_no_frame() {
    let fx = common::tape(2.0);
    let config = PreviewConfig::default();
    let session = Arc::new(MediaSession::open_with(&fx.path, &config).unwrap());
    let service = PreviewService::new(&config);

    service.request_preview(&session, 200.0, PreviewSlot::End);
    assert!(matches!(next_for(&service, PreviewSlot::End), PreviewResult::NoFrame { .. }));
}

#[test]
fn latest_request_wins_per_slot() {
    let fx = common::tape(6.0);
    let config = PreviewConfig::default();
    let session = Arc::new(MediaSession::open_with(&fx.path, &config).unwrap());
    let service = PreviewService::new(&config);

    let tickets: Vec<_> = (0..20)
        .map(|i| service.request_preview(&session, i as f64 * 0.25, PreviewSlot::Start))
        .collect();
    let end_ticket = service.request_preview(&session, 5.0, PreviewSlot::End);
    let last = *tickets.last().unwrap();

    // Results for superseded tickets may still trickle in if they finished
    // before being replaced; the last one always arrives and nothing follows it.
    let mut start_results = Vec::new();
    let mut end_results = Vec::new();
    while start_results.last().map(PreviewResult::ticket) != Some(last) || end_results.is_empty() {
        let r = service.results().recv_timeout(WAIT).expect("preview result");
        match r.ticket().slot {
            PreviewSlot::Start => start_results.push(r),
            PreviewSlot::End   => end_results.push(r),
        }
    }

    assert!(start_results.len() < tickets.len(), "no request was superseded");
    assert!(start_results.windows(2).all(|w| w[0].ticket() < w[1].ticket()));
    match start_results.last().unwrap() {
        PreviewResult::Frame { timestamp, frame, .. } => {
            assert_eq!(*timestamp, 4.75);
            assert!(frame.is_well_formed());
        }
        other => panic!("expected a frame, got {other:?}"),
    }

    // The other slot was not cancelled by any of that.
    assert_eq!(end_results.len(), 1);
    assert_eq!(end_results[0].ticket(), end_ticket);
}

#[test]
fn shutdown_is_clean_and_repeatable() {
    let fx = common::tape(2.0);
    let config = PreviewConfig::default();
    let session = Arc::new(MediaSession::open_with(&fx.path, &config).unwrap());
    let mut service = PreviewService::new(&config);
    service.request_preview(&session, 1.0, PreviewSlot::Start);
    service.shutdown();
    service.shutdown();
    drop(service);
    // The session is no longer shared with any preview thread.
    assert_eq!(Arc::strong_count(&session), 1);
}
