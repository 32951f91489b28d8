//! Integration tests for response fan-out.

mod common;

use common::{collect_stream, texts};
use ensemble_orchestrator::{ResponseRouter, RouterEvent, StreamChunk};
use std::sync::Arc;

#[tokio::test]
async fn test_every_subscriber_sees_chunks_in_order() {
    let router = Arc::new(ResponseRouter::new(16));
    let mut session_a = router.subscribe_session("s1");
    let mut session_b = router.subscribe_session("s1");
    let mut agent = router.subscribe_agent("coder");
    let mut other_session = router.subscribe_session("s2");

    let mut stream = router.open_stream("s1", "coder", "r1");
    for text in ["A", "B", "C"] {
        assert!(stream.write(StreamChunk::text(text)));
    }
    stream.close();
    stream.close();
    assert!(!stream.write(StreamChunk::text("late")));

    for subscription in [&mut session_a, &mut session_b, &mut agent] {
        let events = collect_stream(subscription, "r1").await;
        assert_eq!(texts(&events), vec!["A", "B", "C"]);

        let sequences: Vec<u64> = events
            .iter()
            .filter_map(|event| match event {
                RouterEvent::Chunk { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));

        // One close, nothing after it
        assert!(subscription.try_recv().is_none());
    }

    assert!(other_session.try_recv().is_none());
}

#[tokio::test]
async fn test_interleaved_streams_keep_their_own_order() {
    let router = Arc::new(ResponseRouter::new(64));
    let mut session = router.subscribe_session("s1");

    let mut first = router.open_stream("s1", "coder", "r1");
    let mut second = router.open_stream("s1", "reviewer", "r2");
    for (a, b) in [("1", "x"), ("2", "y"), ("3", "z")] {
        first.write(StreamChunk::text(a));
        second.write(StreamChunk::text(b));
    }
    first.close();
    second.close();

    let events = collect_stream(&mut session, "r2").await;
    let per_request = |request: &str| -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                RouterEvent::Chunk { stream, chunk: StreamChunk::TextDelta { text }, .. }
                    if stream.request_id == request =>
                {
                    Some(text.clone())
                }
                _ => None,
            })
            .collect()
    };
    assert_eq!(per_request("r1"), vec!["1", "2", "3"]);
    assert_eq!(per_request("r2"), vec!["x", "y", "z"]);
}

#[tokio::test]
async fn test_dropped_stream_closes_itself() {
    let router = Arc::new(ResponseRouter::new(8));
    let mut session = router.subscribe_session("s1");

    {
        let mut stream = router.open_stream("s1", "coder", "r1");
        stream.write(StreamChunk::status("thinking"));
    }

    let events = collect_stream(&mut session, "r1").await;
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], RouterEvent::StreamClosed { .. }));
}
