// End-to-end tests: synthetic microphone → controller → in-process analysis server.

mod common;

use std::sync::atomic::Ordering;

use breath_link::audio::FRAME_SAMPLES;
use breath_link::{BreathPhase, CaptureError, ChannelError, ConnectionState, SessionError};
use common::{accept, breath_event_json, controller, listen, step_until, SineBackend};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

/// What the server saw from the client after the handshake.
#[derive(Debug, Default)]
struct Received {
    handshake: Option<Value>,
    frame_sizes: Vec<usize>,
    got_stop: bool,
}

#[tokio::test]
async fn twelve_breaths_calibrate_once() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut received = Received::default();

        if let Some(Ok(Message::Text(text))) = ws.next().await {
            received.handshake = serde_json::from_str(&text).ok();
        }
        for n in 1..=12u32 {
            let phase = if n % 2 == 1 { "inhaling" } else { "exhaling" };
            ws.send(Message::Text(breath_event_json(n, phase).into())).await.unwrap();
        }

        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Binary(data) => received.frame_sizes.push(data.len()),
                Message::Text(text) => {
                    let v: Value = serde_json::from_str(&text).unwrap();
                    if v == json!({"action": "stop"}) {
                        received.got_stop = true;
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        received
    });

    let mut ctl = controller(&url, SineBackend::new());
    ctl.connect().await.unwrap();
    ctl.start_audio_capture().await.unwrap();
    assert!(ctl.is_connected());
    assert!(ctl.is_calibrating());

    step_until(&mut ctl, |c| c.observer().events.len() == 12 && c.frames_sent() >= 2).await;

    assert_eq!(ctl.observer().calibrated_at, vec![9]);
    assert!(!ctl.is_calibrating());
    assert_eq!(ctl.breath_count(), 12);
    assert_eq!(ctl.current_phase(), BreathPhase::Exhaling);
    assert_eq!(ctl.current_phase(), ctl.observer().events[11].phase);
    assert_eq!(ctl.confidence(), 0.9);
    assert!(ctl.observer().errors.is_empty());

    ctl.disconnect();
    ctl.wait_closed().await;
    // The link task has finished, so the counter is final
    let sent = ctl.frames_sent();

    let received = server.await.unwrap();
    assert_eq!(
        received.handshake,
        Some(json!({
            "action": "start",
            "session_id": "session-1",
            "user_id": "user-1",
            "target_breath_duration": 4.0
        }))
    );
    assert!(received.frame_sizes.len() >= 2);
    assert_eq!(received.frame_sizes.len() as u64, sent);
    assert!(received.frame_sizes.iter().all(|&n| n == FRAME_SAMPLES * 2));
    assert!(received.got_stop);
    assert_eq!(
        ctl.observer().states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Closed
        ]
    );
}

#[tokio::test]
async fn server_errors_do_not_end_the_session() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _handshake = ws.next().await;
        for text in [
            r#"{"type":"error","message":"analyzer warming up"}"#.to_string(),
            r#"{"type":"session_summary","breaths":3}"#.to_string(),
            "{not json".to_string(),
            breath_event_json(1, "holding"),
        ] {
            ws.send(Message::Text(text.into())).await.unwrap();
        }
        // Stay up until the client leaves
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let mut ctl = controller(&url, SineBackend::new());
    ctl.connect().await.unwrap();

    step_until(&mut ctl, |c| c.observer().events.len() == 1).await;

    assert_eq!(
        ctl.observer().errors,
        vec![SessionError::ServerReported("analyzer warming up".into())]
    );
    assert!(ctl.is_connected());
    assert_eq!(ctl.current_phase(), BreathPhase::Holding);
    assert_eq!(ctl.breath_count(), 1);

    ctl.disconnect();
    ctl.wait_closed().await;
    server.await.unwrap();
}

#[tokio::test]
async fn unexpected_close_is_reported_once_and_releases_the_microphone() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let _handshake = ws.next().await;
        ws.send(Message::Text(breath_event_json(1, "inhaling").into())).await.unwrap();
        ws.close(None).await.unwrap();
        // Drain until the client answers the close handshake
        while let Some(Ok(_)) = ws.next().await {}
    });

    let backend = SineBackend::new();
    let released = backend.released.clone();
    let mut ctl = controller(&url, backend);
    ctl.connect().await.unwrap();
    ctl.start_audio_capture().await.unwrap();

    // Runs until nothing is live: the close tears the whole session down
    tokio::time::timeout(std::time::Duration::from_secs(5), ctl.run())
        .await
        .expect("session did not end after the server closed");

    assert!(!ctl.is_connected());
    assert!(!ctl.is_capturing());
    assert_eq!(ctl.connection_state(), ConnectionState::Closed);
    assert_eq!(ctl.observer().fatal_errors(), 1);
    assert!(matches!(
        ctl.observer().errors[0],
        SessionError::Channel(ChannelError::Closed(_) | ChannelError::Transport(_))
    ));
    assert_eq!(released.load(Ordering::SeqCst), 1);

    ctl.disconnect();
    ctl.disconnect();
    assert_eq!(ctl.observer().fatal_errors(), 1);
    assert_eq!(released.load(Ordering::SeqCst), 1);
    server.await.unwrap();
}

#[tokio::test]
async fn denied_microphone_fails_the_session() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut texts = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) => texts.push(serde_json::from_str::<Value>(&text).unwrap()),
                Message::Close(_) => break,
                _ => {}
            }
        }
        texts
    });

    let mut ctl = controller(&url, SineBackend::denied());
    ctl.connect().await.unwrap();

    let err = ctl.start_audio_capture().await.unwrap_err();
    assert_eq!(err, SessionError::Capture(CaptureError::PermissionDenied));
    assert_eq!(ctl.observer().errors, vec![err]);
    assert!(!ctl.is_connected());

    ctl.disconnect();
    ctl.wait_closed().await;
    assert_eq!(ctl.observer().fatal_errors(), 1);

    let texts = server.await.unwrap();
    assert_eq!(texts.first().and_then(|v| v.get("action")), Some(&json!("start")));
    assert_eq!(texts.last(), Some(&json!({"action": "stop"})));
}

#[tokio::test]
async fn capture_before_connect_drops_frames_silently() {
    let backend = SineBackend::new();
    let released = backend.released.clone();
    let mut ctl = controller("ws://127.0.0.1:9/unused", backend);

    ctl.start_audio_capture().await.unwrap();
    step_until(&mut ctl, |c| c.frames_dropped() >= 3).await;

    assert_eq!(ctl.frames_sent(), 0);
    assert!(ctl.observer().errors.is_empty());
    assert_eq!(ctl.connection_state(), ConnectionState::Disconnected);

    ctl.disconnect();
    ctl.disconnect();
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert!(!ctl.step().await);
}

#[tokio::test]
async fn teardown_without_connect_is_a_no_op() {
    let backend = SineBackend::new();
    let opened = backend.opened.clone();
    let released = backend.released.clone();
    let mut ctl = controller("ws://127.0.0.1:9/unused", backend);

    ctl.disconnect();
    ctl.disconnect();
    ctl.wait_closed().await;
    drop(ctl);

    assert_eq!(opened.load(Ordering::SeqCst), 0);
    assert_eq!(released.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_connect_and_start_are_no_ops() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let mut handshakes = 0;
        while let Some(Ok(msg)) = ws.next().await {
            match msg {
                Message::Text(text) if text.contains("\"start\"") => handshakes += 1,
                Message::Close(_) => break,
                _ => {}
            }
        }
        handshakes
    });

    let backend = SineBackend::new();
    let opened = backend.opened.clone();
    let mut ctl = controller(&url, backend);

    ctl.connect().await.unwrap();
    ctl.connect().await.unwrap();
    ctl.start_audio_capture().await.unwrap();
    ctl.start_audio_capture().await.unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 1);

    ctl.disconnect();
    ctl.wait_closed().await;
    assert_eq!(server.await.unwrap(), 1);
}
