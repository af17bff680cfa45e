//! Backend stream → Messages stream translation.
//!
//! Three layers, each usable on its own:
//! - `SseFrameDecoder` turns arbitrary byte chunks into complete SSE frames.
//! - `UpstreamEventParser` turns one frame payload into an `UpstreamEvent`.
//! - `StreamTransformer` is the state machine that turns events into front
//!   `StreamEvent`s while keeping block nesting and usage accounting correct.
//!
//! `UpstreamTranslator` wires the three together for a single response body.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::models::messages::{
    BlockDelta, MessageDeltaBody, MessageResponse, OutputBlock, StopReason, StreamEvent, Usage,
};
use crate::models::upstream::{UpstreamEvent, UpstreamFrame};
use crate::tokenizer::TokenEstimator;

#[derive(Debug, Error)]
pub enum StreamDecodeError {
    #[error("malformed frame payload: {source}")]
    Json {
        #[source]
        source: serde_json::Error,
        payload: String,
    },
}

// ============================================================================
// Frame decoding
// ============================================================================

pub(crate) fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

/// Reassembles SSE frames from a chunked byte stream.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buffer: Vec<u8>,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed, without delimiters.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            if !trim_ascii(&frame).is_empty() {
                frames.push(frame);
            }
        }
        frames
    }

    /// Trailing bytes that never saw a blank line, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buffer);
        if trim_ascii(&rest).is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    fn next_frame(&mut self) -> Option<Vec<u8>> {
        // "\n\r\n" covers "\r\n\r\n"; the leftover '\r' is stripped per line.
        let lf = self.buffer.windows(2).position(|w| w == b"\n\n");
        let crlf = self.buffer.windows(3).position(|w| w == b"\n\r\n");
        let (pos, delim) = match (lf, crlf) {
            (Some(a), Some(b)) if b < a => (b, 3),
            (Some(a), _) => (a, 2),
            (None, Some(b)) => (b, 3),
            (None, None) => return None,
        };
        let mut frame: Vec<u8> = self.buffer.drain(..pos + delim).collect();
        frame.truncate(pos);
        Some(frame)
    }
}

/// Concatenated `data:` payload of one frame; `None` for comment-only frames.
pub fn frame_data(frame: &[u8]) -> Option<Vec<u8>> {
    let mut data_segments: Vec<&[u8]> = Vec::new();
    for line in frame.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(rest) = line.strip_prefix(b"data:") {
            data_segments.push(trim_ascii(rest));
        }
    }
    if data_segments.is_empty() {
        return None;
    }
    Some(data_segments.join(&b'\n'))
}

// ============================================================================
// Event parsing
// ============================================================================

/// Maps one frame payload onto the stable event set.
pub trait UpstreamEventParser: Send {
    fn parse(&mut self, payload: &[u8]) -> Result<Option<UpstreamEvent>, StreamDecodeError>;
}

/// Parser for the MorphLLM UI message stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct MorphEventParser;

impl UpstreamEventParser for MorphEventParser {
    fn parse(&mut self, payload: &[u8]) -> Result<Option<UpstreamEvent>, StreamDecodeError> {
        let payload = trim_ascii(payload);
        if payload.is_empty() {
            return Ok(None);
        }
        if payload == b"[DONE]" {
            return Ok(Some(UpstreamEvent::Terminator {
                finish_reason: None,
            }));
        }
        serde_json::from_slice::<UpstreamFrame>(payload)
            .map(UpstreamFrame::into_event)
            .map_err(|source| StreamDecodeError::Json {
                source,
                payload: String::from_utf8_lossy(payload).into_owned(),
            })
    }
}

// ============================================================================
// State machine
// ============================================================================

/// A tool call whose arguments are still arriving.
#[derive(Debug)]
struct PendingTool {
    id: String,
    name: String,
    args: String,
}

/// Turns backend events into a well-nested Messages event sequence.
///
/// Text streams through as it arrives. Tool calls are buffered per call id and
/// emitted as one complete block (start, one `input_json_delta`, stop) when the
/// call ends, so interleaved calls never share or reopen a block. Calls still
/// pending at the terminator are flushed in the order they started.
pub struct StreamTransformer {
    message_id: String,
    model: String,
    input_tokens: u32,
    estimator: Arc<dyn TokenEstimator>,
    next_index: usize,
    open_text: Option<usize>,
    pending_tools: Vec<PendingTool>,
    used_tool: bool,
    output_text: String,
    finished: bool,
}

impl StreamTransformer {
    pub fn new(
        message_id: String,
        model: String,
        input_tokens: u32,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        Self {
            message_id,
            model,
            input_tokens,
            estimator,
            next_index: 0,
            open_text: None,
            pending_tools: Vec::new(),
            used_tool: false,
            output_text: String::new(),
            finished: false,
        }
    }

    pub fn start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessageResponse::empty(
                self.message_id.clone(),
                self.model.clone(),
                self.input_tokens,
            ),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn on_event(&mut self, event: UpstreamEvent) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }

        match event {
            UpstreamEvent::TextDelta(text) => {
                if text.is_empty() {
                    return out;
                }
                let index = match self.open_text {
                    Some(index) => index,
                    None => {
                        let index = self.take_index();
                        out.push(StreamEvent::ContentBlockStart {
                            index,
                            content_block: OutputBlock::Text {
                                text: String::new(),
                            },
                        });
                        self.open_text = Some(index);
                        index
                    }
                };
                self.output_text.push_str(&text);
                out.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::TextDelta { text },
                });
            }
            UpstreamEvent::ToolCallStart { id, name } => {
                if self.pending_tools.iter().any(|t| t.id == id) {
                    warn!("Duplicate start for tool call {}", id);
                } else {
                    self.pending_tools.push(PendingTool {
                        id,
                        name,
                        args: String::new(),
                    });
                }
            }
            UpstreamEvent::ToolCallArgumentDelta { id, delta } => {
                match self.pending_tools.iter_mut().find(|t| t.id == id) {
                    Some(tool) => tool.args.push_str(&delta),
                    None => warn!("Argument delta for unknown tool call {}", id),
                }
            }
            UpstreamEvent::ToolCallEnd { id, name, input } => {
                let tool = match self.pending_tools.iter().position(|t| t.id == id) {
                    Some(pos) => self.pending_tools.remove(pos),
                    // Backend skipped the streaming phase for this call.
                    None => PendingTool {
                        id,
                        name: name.unwrap_or_else(|| "unknown".to_string()),
                        args: String::new(),
                    },
                };
                self.emit_tool(tool, input, &mut out);
            }
            UpstreamEvent::Terminator { finish_reason } => {
                for tool in std::mem::take(&mut self.pending_tools) {
                    warn!("Tool call {} never ended; flushing at terminator", tool.id);
                    self.emit_tool(tool, None, &mut out);
                }
                self.close_text(&mut out);
                let stop_reason = if self.used_tool {
                    StopReason::ToolUse
                } else if finish_reason.as_deref() == Some("length") {
                    StopReason::MaxTokens
                } else {
                    StopReason::EndTurn
                };
                out.push(StreamEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(stop_reason),
                        stop_sequence: None,
                    },
                    usage: self.usage(),
                });
                out.push(StreamEvent::MessageStop);
                self.finished = true;
            }
            UpstreamEvent::Error { message } => {
                out.push(StreamEvent::api_error(message));
                self.finished = true;
            }
        }
        out
    }

    /// Terminal error for a stream that ended without a terminator.
    pub fn on_connection_lost(&mut self, reason: &str) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![StreamEvent::api_error(reason)]
    }

    /// Usage so far: fixed input count, estimator over everything emitted.
    pub fn usage(&self) -> Usage {
        Usage {
            input_tokens: self.input_tokens,
            output_tokens: self.estimator.count(&self.output_text),
        }
    }

    fn take_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn close_text(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(index) = self.open_text.take() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }

    /// Emit one complete tool_use block for a finished call.
    fn emit_tool(&mut self, tool: PendingTool, input: Option<Value>, out: &mut Vec<StreamEvent>) {
        let json = resolve_arguments(&tool, input);
        self.close_text(out);
        let index = self.take_index();
        self.used_tool = true;
        self.output_text.push_str(&tool.name);
        self.output_text.push_str(&json);
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: OutputBlock::ToolUse {
                id: tool.id,
                name: tool.name,
                input: Value::Object(Default::default()),
            },
        });
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::InputJsonDelta { partial_json: json },
        });
        out.push(StreamEvent::ContentBlockStop { index });
    }
}

/// Accumulated arguments when they parse, else the end frame's `input`, else `{}`.
fn resolve_arguments(tool: &PendingTool, input: Option<Value>) -> String {
    if !tool.args.is_empty() {
        match serde_json::from_str::<Value>(&tool.args) {
            Ok(_) => return tool.args.clone(),
            Err(e) => warn!("Tool call {} arguments are not valid JSON: {}", tool.id, e),
        }
    }
    match input {
        Some(input) => input.to_string(),
        None => "{}".to_string(),
    }
}

// ============================================================================
// Translator
// ============================================================================

/// Decoder, parser and transformer for one backend response body.
pub struct UpstreamTranslator<P = MorphEventParser> {
    decoder: SseFrameDecoder,
    parser: P,
    transformer: StreamTransformer,
    decode_errors: usize,
}

impl UpstreamTranslator<MorphEventParser> {
    pub fn new(transformer: StreamTransformer) -> Self {
        Self::with_parser(MorphEventParser, transformer)
    }
}

impl<P: UpstreamEventParser> UpstreamTranslator<P> {
    pub fn with_parser(parser: P, transformer: StreamTransformer) -> Self {
        Self {
            decoder: SseFrameDecoder::new(),
            parser,
            transformer,
            decode_errors: 0,
        }
    }

    pub fn start(&self) -> StreamEvent {
        self.transformer.start()
    }

    pub fn is_finished(&self) -> bool {
        self.transformer.is_finished()
    }

    pub fn decode_errors(&self) -> usize {
        self.decode_errors
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        for frame in self.decoder.push(chunk) {
            self.handle_frame(&frame, &mut out);
        }
        out
    }

    /// End of body: flush any unterminated frame, then fail if still open.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if let Some(frame) = self.decoder.finish() {
            self.handle_frame(&frame, &mut out);
        }
        out.extend(
            self.transformer
                .on_connection_lost("upstream stream ended before completion"),
        );
        out
    }

    /// Transport failure mid-body.
    pub fn fail(&mut self, reason: &str) -> Vec<StreamEvent> {
        self.transformer.on_connection_lost(reason)
    }

    fn handle_frame(&mut self, frame: &[u8], out: &mut Vec<StreamEvent>) {
        let Some(payload) = frame_data(frame) else {
            return;
        };
        match self.parser.parse(&payload) {
            Ok(Some(event)) => out.extend(self.transformer.on_event(event)),
            Ok(None) => {}
            Err(e) => {
                self.decode_errors += 1;
                warn!("Skipping upstream frame: {}", e);
            }
        }
    }
}
