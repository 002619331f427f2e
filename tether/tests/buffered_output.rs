//! Integration tests for the buffered output channel: ordering, silent
//! reconnection, offline-timeout close, and lifecycle misuse.

use std::sync::Arc;
use std::time::Duration;

use tether::testing::{OutputRecord, RecordingOutputHandler, ScriptedOutputChannel};
use tether::{
    BufferConfig, BufferedOutputChannel, ChannelError, MessageData, OutputDuplexChannel,
    TokioProviders,
};

fn text(s: &str) -> MessageData {
    MessageData::Text(s.to_string())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn make_channel(
    config: BufferConfig,
) -> (
    Arc<ScriptedOutputChannel>,
    BufferedOutputChannel<TokioProviders>,
    Arc<RecordingOutputHandler>,
) {
    init_tracing();
    let raw = Arc::new(ScriptedOutputChannel::new("tcp://127.0.0.1:9090/"));
    let buffered = BufferedOutputChannel::new(raw.clone(), TokioProviders::new(), config);
    let handler = RecordingOutputHandler::new();
    buffered.set_event_handler(Some(handler.clone()));
    (raw, buffered, handler)
}

/// Let spawned tasks run without advancing the clock.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn closed_count(handler: &RecordingOutputHandler) -> usize {
    handler
        .records()
        .iter()
        .filter(|r| matches!(r, OutputRecord::Closed(_)))
        .count()
}

fn opened_count(handler: &RecordingOutputHandler) -> usize {
    handler
        .records()
        .iter()
        .filter(|r| matches!(r, OutputRecord::Opened(_)))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_send_before_open_is_rejected() {
    let (_raw, buffered, _handler) = make_channel(BufferConfig::default());

    let result = buffered.send_message(text("early")).await;
    assert!(matches!(result, Err(ChannelError::NotConnected)));
    assert!(!buffered.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_double_open_is_rejected() {
    let (_raw, buffered, _handler) = make_channel(BufferConfig::default());

    buffered.open_connection().await.expect("open");
    let result = buffered.open_connection().await;
    assert!(matches!(result, Err(ChannelError::AlreadyConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_messages_flow_in_order_once_connected() {
    let (raw, buffered, handler) = make_channel(BufferConfig::default());

    buffered.open_connection().await.expect("open");
    settle().await;
    assert_eq!(opened_count(&handler), 1);

    for i in 0..3 {
        buffered
            .send_message(text(&format!("m{}", i)))
            .await
            .expect("send");
    }
    settle().await;

    assert_eq!(raw.sent_messages(), vec![text("m0"), text("m1"), text("m2")]);
    assert_eq!(buffered.pending_message_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_retries_until_transport_appears() {
    let (raw, buffered, handler) = make_channel(BufferConfig::default());
    raw.fail_next_opens(3);

    buffered.open_connection().await.expect("open");
    // Sends are accepted while the first connect is still being retried.
    assert!(buffered.is_connected());
    buffered.send_message(text("queued")).await.expect("send");

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(raw.open_attempts(), 4);
    assert_eq!(raw.sent_messages(), vec![text("queued")]);
    assert_eq!(opened_count(&handler), 1);
    assert_eq!(closed_count(&handler), 0);
}

#[tokio::test(start_paused = true)]
async fn test_short_drop_is_absorbed_and_pending_resent() {
    let (raw, buffered, handler) = make_channel(BufferConfig::default());

    buffered.open_connection().await.expect("open");
    settle().await;
    buffered.send_message(text("before")).await.expect("send");
    settle().await;

    // Transport drops; the next two reconnect attempts fail too.
    raw.fail_next_opens(2);
    raw.fire_connection_closed();
    settle().await;

    // The channel still accepts sends while offline.
    assert!(buffered.is_connected());
    buffered.send_message(text("during")).await.expect("send");

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(raw.sent_messages(), vec![text("before"), text("during")]);
    assert_eq!(closed_count(&handler), 0);
}

#[tokio::test(start_paused = true)]
async fn test_send_failures_retry_same_message_without_reordering() {
    let (raw, buffered, _handler) = make_channel(BufferConfig::default());

    buffered.open_connection().await.expect("open");
    settle().await;

    raw.set_fail_sends(true);
    buffered.send_message(text("first")).await.expect("send");
    buffered.send_message(text("second")).await.expect("send");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(raw.sent_messages(), Vec::<MessageData>::new());
    assert_eq!(buffered.pending_message_count(), 2);

    raw.set_fail_sends(false);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(raw.sent_messages(), vec![text("first"), text("second")]);
    assert_eq!(buffered.pending_message_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_long_drop_closes_exactly_once() {
    let config = BufferConfig::new(Duration::from_secs(1));
    let (raw, buffered, handler) = make_channel(config);

    buffered.open_connection().await.expect("open");
    settle().await;

    raw.fail_next_opens(usize::MAX);
    raw.fire_connection_closed();
    buffered.send_message(text("doomed")).await.expect("send");

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(closed_count(&handler), 1);
    assert!(!buffered.is_connected());
    assert_eq!(buffered.pending_message_count(), 0);
    let result = buffered.send_message(text("late")).await;
    assert!(matches!(result, Err(ChannelError::NotConnected)));
}

#[tokio::test(start_paused = true)]
async fn test_never_connecting_closes_without_opened_event() {
    let config = BufferConfig::new(Duration::from_secs(1));
    let (raw, buffered, handler) = make_channel(config);
    raw.fail_next_opens(usize::MAX);

    buffered.open_connection().await.expect("open");
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(opened_count(&handler), 0);
    assert_eq!(closed_count(&handler), 1);
    assert!(!buffered.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent_and_channel_is_reusable() {
    let (raw, buffered, _handler) = make_channel(BufferConfig::default());

    buffered.open_connection().await.expect("open");
    settle().await;
    buffered.send_message(text("first life")).await.expect("send");
    settle().await;

    buffered.close_connection().await;
    buffered.close_connection().await;
    assert!(!buffered.is_connected());
    assert!(matches!(
        buffered.send_message(text("while closed")).await,
        Err(ChannelError::NotConnected)
    ));

    buffered.open_connection().await.expect("reopen");
    settle().await;
    buffered.send_message(text("second life")).await.expect("send");
    settle().await;

    assert_eq!(
        raw.sent_messages(),
        vec![text("first life"), text("second life")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_responses_are_forwarded_in_order() {
    let (raw, buffered, handler) = make_channel(BufferConfig::default());

    buffered.open_connection().await.expect("open");
    settle().await;

    raw.fire_response(text("r0"));
    raw.fire_response(text("r1"));
    settle().await;

    assert_eq!(handler.responses(), vec![text("r0"), text("r1")]);
}

#[tokio::test(start_paused = true)]
async fn test_close_discards_pending_messages() {
    let (raw, buffered, _handler) = make_channel(BufferConfig::default());
    raw.fail_next_opens(usize::MAX);

    buffered.open_connection().await.expect("open");
    buffered.send_message(text("never sent")).await.expect("send");
    assert_eq!(buffered.pending_message_count(), 1);

    buffered.close_connection().await;

    assert_eq!(buffered.pending_message_count(), 0);
    assert_eq!(raw.sent_messages(), Vec::<MessageData>::new());
}
