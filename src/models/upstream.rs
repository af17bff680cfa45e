//! Backend (MorphLLM chat) models.
//!
//! The backend accepts UI-message shaped requests (`messages[].parts[]`) and answers
//! with an SSE stream of typed JSON frames. `UpstreamFrame` is the raw frame grammar;
//! `UpstreamEvent` is the stable event set the stream transformer consumes, so the
//! frame grammar can change without touching front-protocol emission.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::messages::Role;

/// Value of the `trigger` field for a fresh user turn.
pub const SUBMIT_TRIGGER: &str = "submit-message";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<UpstreamMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<UpstreamTool>>,
    pub max_output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    pub trigger: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub id: String,
    pub role: Role,
    pub parts: Vec<UpstreamPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamPart {
    Text {
        text: String,
    },
    File {
        #[serde(rename = "mediaType", default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        url: String,
    },
    ToolCall {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        input: Value,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<UpstreamToolOutput>,
        #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpstreamToolOutput {
    Text(String),
    Parts(Vec<UpstreamPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// One JSON payload carried by a backend `data:` frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpstreamFrame {
    TextDelta {
        #[serde(default, alias = "textDelta")]
        delta: String,
    },
    ToolInputStart {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
    },
    ToolInputDelta {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "inputTextDelta", default)]
        input_text_delta: String,
    },
    ToolInputAvailable {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        #[serde(rename = "toolName", default)]
        tool_name: Option<String>,
        #[serde(default)]
        input: Option<Value>,
    },
    Finish {
        #[serde(rename = "finishReason", default)]
        finish_reason: Option<String>,
    },
    Error {
        #[serde(rename = "errorText", default)]
        error_text: String,
    },
    /// Lifecycle frames (`start`, `text-start`, `finish-step`, `reasoning-*`, ...).
    #[serde(other)]
    Other,
}

/// Backend stream events as seen by the transformer.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallArgumentDelta {
        id: String,
        delta: String,
    },
    ToolCallEnd {
        id: String,
        name: Option<String>,
        input: Option<Value>,
    },
    Terminator {
        finish_reason: Option<String>,
    },
    Error {
        message: String,
    },
}

impl UpstreamFrame {
    /// Map a frame onto the event set; lifecycle frames carry no event.
    pub fn into_event(self) -> Option<UpstreamEvent> {
        match self {
            UpstreamFrame::TextDelta { delta } => Some(UpstreamEvent::TextDelta(delta)),
            UpstreamFrame::ToolInputStart {
                tool_call_id,
                tool_name,
            } => Some(UpstreamEvent::ToolCallStart {
                id: tool_call_id,
                name: tool_name,
            }),
            UpstreamFrame::ToolInputDelta {
                tool_call_id,
                input_text_delta,
            } => Some(UpstreamEvent::ToolCallArgumentDelta {
                id: tool_call_id,
                delta: input_text_delta,
            }),
            UpstreamFrame::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
            } => Some(UpstreamEvent::ToolCallEnd {
                id: tool_call_id,
                name: tool_name,
                input,
            }),
            UpstreamFrame::Finish { finish_reason } => {
                Some(UpstreamEvent::Terminator { finish_reason })
            }
            UpstreamFrame::Error { error_text } => Some(UpstreamEvent::Error {
                message: error_text,
            }),
            UpstreamFrame::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_keys() {
        let req = UpstreamRequest {
            model: "m".into(),
            system: None,
            messages: vec![UpstreamMessage {
                id: "msg-0".into(),
                role: Role::User,
                parts: vec![UpstreamPart::ToolCall {
                    tool_call_id: "c1".into(),
                    tool_name: "ls".into(),
                    input: json!({}),
                }],
            }],
            tools: None,
            max_output_tokens: 10,
            temperature: None,
            stop_sequences: None,
            trigger: SUBMIT_TRIGGER.into(),
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["maxOutputTokens"], 10);
        assert_eq!(v["messages"][0]["parts"][0]["type"], "tool-call");
        assert_eq!(v["messages"][0]["parts"][0]["toolCallId"], "c1");
        assert!(v.get("system").is_none());
    }

    #[test]
    fn lifecycle_frames_map_to_nothing() {
        let frame: UpstreamFrame =
            serde_json::from_value(json!({"type": "start-step", "foo": 1})).unwrap();
        assert_eq!(frame.into_event(), None);
    }

    #[test]
    fn legacy_text_delta_key_is_accepted() {
        let frame: UpstreamFrame =
            serde_json::from_value(json!({"type": "text-delta", "textDelta": "hi"})).unwrap();
        assert_eq!(frame.into_event(), Some(UpstreamEvent::TextDelta("hi".into())));
    }
}
