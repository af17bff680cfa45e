//! Runtime for one translated response.
//!
//! Streaming turns run as two stages joined by a bounded channel. The producer
//! (spawned) reads the backend body, translates it and pushes encoded SSE bytes;
//! the consumer is the HTTP body stream, which drains the channel at the client's
//! pace and fills idle gaps with `ping` events. Dropping the consumer closes the
//! channel, and the producer notices on its next read and drops the backend body.

use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::debug_log::DebugSession;
use crate::models::messages::{BlockDelta, MessageResponse, OutputBlock, StreamEvent};
use crate::stream::UpstreamTranslator;

/// How a translated response ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Failed(String),
    /// The client went away first.
    Cancelled,
}

/// `event: <name>\ndata: <json>\n\n`
pub fn encode_sse(event: &StreamEvent) -> Bytes {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("Failed to serialize stream event: {}", e);
        "{}".to_string()
    });
    Bytes::from(format!("event: {}\ndata: {}\n\n", event.event_name(), data))
}

fn terminal_outcome(event: &StreamEvent) -> Option<StreamOutcome> {
    match event {
        StreamEvent::MessageStop => Some(StreamOutcome::Completed),
        StreamEvent::Error { error } => Some(StreamOutcome::Failed(error.message.clone())),
        _ => None,
    }
}

/// Start both stages. Returns the client body and the producer's handle.
pub fn spawn_streaming<S, E>(
    body: S,
    translator: UpstreamTranslator,
    buffer: usize,
    ping_interval: Duration,
    debug: Option<DebugSession>,
) -> (
    BoxStream<'static, Result<Bytes, std::io::Error>>,
    JoinHandle<StreamOutcome>,
)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Bytes>(buffer.max(1));
    let handle = tokio::spawn(async move {
        let outcome = produce(body, translator, &tx, debug.as_ref()).await;
        debug!("Stream producer finished: {:?}", outcome);
        outcome
    });
    (consume(rx, ping_interval).boxed(), handle)
}

async fn produce<S, E>(
    body: S,
    mut translator: UpstreamTranslator,
    tx: &mpsc::Sender<Bytes>,
    debug: Option<&DebugSession>,
) -> StreamOutcome
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = Box::pin(body);
    let mut pending = vec![translator.start()];

    loop {
        for event in pending.drain(..) {
            let bytes = encode_sse(&event);
            if let Some(d) = debug {
                d.record_client(&bytes).await;
            }
            if tx.send(bytes).await.is_err() {
                return StreamOutcome::Cancelled;
            }
            if let Some(outcome) = terminal_outcome(&event) {
                return outcome;
            }
        }

        let next = tokio::select! {
            _ = tx.closed() => return StreamOutcome::Cancelled,
            next = body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if let Some(d) = debug {
                    d.record_upstream(&chunk).await;
                }
                pending = translator.push(&chunk);
            }
            Some(Err(e)) => {
                warn!("Upstream read failed: {}", e);
                pending = translator.fail(&format!("upstream read failed: {}", e));
            }
            None => {
                pending = translator.finish();
                if pending.is_empty() {
                    return StreamOutcome::Failed("upstream stream ended".to_string());
                }
            }
        }
    }
}

fn consume(
    rx: mpsc::Receiver<Bytes>,
    ping_interval: Duration,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    async_stream::stream! {
        let mut rx = rx;
        loop {
            match tokio::time::timeout(ping_interval, rx.recv()).await {
                Ok(Some(bytes)) => yield Ok(bytes),
                Ok(None) => break,
                Err(_) => yield Ok(encode_sse(&StreamEvent::Ping)),
            }
        }
    }
}

// ============================================================================
// Non-streaming aggregation
// ============================================================================

/// Read the whole backend body and fold it into one Message.
pub async fn collect_message<S, E>(
    body: S,
    mut translator: UpstreamTranslator,
    debug: Option<&DebugSession>,
) -> Result<MessageResponse, String>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut body = Box::pin(body);
    let mut events = vec![translator.start()];
    while let Some(next) = body.next().await {
        match next {
            Ok(chunk) => {
                if let Some(d) = debug {
                    d.record_upstream(&chunk).await;
                }
                events.extend(translator.push(&chunk));
            }
            Err(e) => {
                events.extend(translator.fail(&format!("upstream read failed: {}", e)));
                break;
            }
        }
        if translator.is_finished() {
            break;
        }
    }
    events.extend(translator.finish());
    fold_events(&events)
}

/// Build the final Message from a complete event sequence.
pub fn fold_events(events: &[StreamEvent]) -> Result<MessageResponse, String> {
    let mut message: Option<MessageResponse> = None;
    let mut tool_args: Vec<(usize, String)> = Vec::new();

    for event in events {
        match event {
            StreamEvent::MessageStart { message: m } => message = Some(m.clone()),
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let Some(m) = message.as_mut() {
                    m.content.push(content_block.clone());
                }
                if matches!(content_block, OutputBlock::ToolUse { .. }) {
                    tool_args.push((*index, String::new()));
                }
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => {
                    if let Some(OutputBlock::Text { text: acc }) =
                        message.as_mut().and_then(|m| m.content.get_mut(*index))
                    {
                        acc.push_str(text);
                    }
                }
                BlockDelta::InputJsonDelta { partial_json } => {
                    if let Some((_, acc)) = tool_args.iter_mut().find(|(i, _)| i == index) {
                        acc.push_str(partial_json);
                    }
                }
            },
            StreamEvent::ContentBlockStop { index } => {
                if let Some((_, args)) = tool_args.iter().find(|(i, _)| i == index) {
                    if let Some(OutputBlock::ToolUse { input, .. }) =
                        message.as_mut().and_then(|m| m.content.get_mut(*index))
                    {
                        *input = if args.trim().is_empty() {
                            Value::Object(Default::default())
                        } else {
                            serde_json::from_str(args)
                                .unwrap_or_else(|_| Value::String(args.clone()))
                        };
                    }
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(m) = message.as_mut() {
                    m.stop_reason = delta.stop_reason;
                    m.stop_sequence = delta.stop_sequence.clone();
                    m.usage = *usage;
                }
            }
            StreamEvent::MessageStop => {
                return message.ok_or_else(|| "stream ended without a message".to_string());
            }
            StreamEvent::Error { error } => return Err(error.message.clone()),
            StreamEvent::Ping => {}
        }
    }
    Err("stream ended before completion".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::messages::StopReason;
    use crate::stream::StreamTransformer;
    use crate::tokenizer::HeuristicEstimator;
    use std::sync::Arc;

    fn translator() -> UpstreamTranslator {
        UpstreamTranslator::new(StreamTransformer::new(
            "msg_1".into(),
            "m".into(),
            5,
            Arc::new(HeuristicEstimator),
        ))
    }

    fn chunks(parts: &[&str]) -> Vec<Result<Bytes, std::io::Error>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect()
    }

    #[test]
    fn encodes_event_and_data_lines() {
        let bytes = encode_sse(&StreamEvent::MessageStop);
        assert_eq!(
            &bytes[..],
            b"event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
    }

    #[tokio::test]
    async fn streams_all_events_and_completes() {
        let body = futures_util::stream::iter(chunks(&[
            "data: {\"type\":\"text-delta\",\"delta\":\"hi\"}\n\n",
            "data: {\"type\":\"finish\"}\n\n",
        ]));
        let (out, handle) = spawn_streaming(body, translator(), 4, Duration::from_secs(5), None);
        let collected: Vec<Bytes> = out.map(|r| r.unwrap()).collect().await;
        let text = String::from_utf8(collected.concat()).unwrap();

        assert!(text.starts_with("event: message_start\n"));
        assert!(text.contains("event: content_block_delta\n"));
        assert!(text.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
        assert_eq!(handle.await.unwrap(), StreamOutcome::Completed);
    }

    #[tokio::test]
    async fn client_disconnect_cancels_producer() {
        let body = futures_util::stream::iter(chunks(&[
            "data: {\"type\":\"text-delta\",\"delta\":\"hi\"}\n\n",
        ]))
        .chain(futures_util::stream::pending());
        let (mut out, handle) =
            spawn_streaming(body, translator(), 4, Duration::from_secs(5), None);

        // Read the first event, then hang up.
        assert!(out.next().await.is_some());
        drop(out);

        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("producer did not stop")
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
    }

    #[tokio::test]
    async fn idle_stream_gets_pings() {
        let body = futures_util::stream::pending::<Result<Bytes, std::io::Error>>();
        let (mut out, handle) =
            spawn_streaming(body, translator(), 4, Duration::from_millis(20), None);

        let mut saw_start = false;
        loop {
            let item = out.next().await.unwrap().unwrap();
            if item.starts_with(b"event: message_start") {
                saw_start = true;
            } else if item.starts_with(b"event: ping") && saw_start {
                break;
            }
        }

        drop(out);
        let outcome = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, StreamOutcome::Cancelled);
    }

    #[tokio::test]
    async fn read_error_fails_the_stream() {
        let body = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"text-delta\",\"delta\":\"a\"}\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let (out, handle) = spawn_streaming(body, translator(), 4, Duration::from_secs(5), None);
        let text = String::from_utf8(out.map(|r| r.unwrap()).collect::<Vec<_>>().await.concat())
            .unwrap();
        assert!(text.contains("event: error\n"));
        assert!(!text.contains("message_stop"));
        assert!(matches!(handle.await.unwrap(), StreamOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn aggregates_text_and_tool_blocks() {
        let body = futures_util::stream::iter(chunks(&[
            "data: {\"type\":\"text-delta\",\"delta\":\"Let me \"}\n\n",
            "data: {\"type\":\"text-delta\",\"delta\":\"check.\"}\n\n",
            "data: {\"type\":\"tool-input-start\",\"toolCallId\":\"c1\",\"toolName\":\"read\"}\n\n",
            "data: {\"type\":\"tool-input-delta\",\"toolCallId\":\"c1\",\"inputTextDelta\":\"{\\\"path\\\":\"}\n\n",
            "data: {\"type\":\"tool-input-delta\",\"toolCallId\":\"c1\",\"inputTextDelta\":\"\\\"a.rs\\\"}\"}\n\n",
            "data: {\"type\":\"tool-input-available\",\"toolCallId\":\"c1\"}\n\n",
            "data: {\"type\":\"finish\"}\n\n",
        ]));
        let message = collect_message(body, translator(), None).await.unwrap();

        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(message.usage.input_tokens, 5);
        assert!(message.usage.output_tokens > 0);
        assert_eq!(
            message.content,
            vec![
                OutputBlock::Text {
                    text: "Let me check.".into()
                },
                OutputBlock::ToolUse {
                    id: "c1".into(),
                    name: "read".into(),
                    input: serde_json::json!({"path": "a.rs"}),
                },
            ]
        );
    }

    #[tokio::test]
    async fn aggregation_reports_backend_error() {
        let body = futures_util::stream::iter(chunks(&[
            "data: {\"type\":\"error\",\"errorText\":\"quota\"}\n\n",
        ]));
        let err = collect_message(body, translator(), None).await.unwrap_err();
        assert_eq!(err, "quota");
    }
}
