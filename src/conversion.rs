use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::models::messages as msg;
use crate::models::upstream as up;

// ============================================================================
// Model policy
// ============================================================================

/// Default model substitution and the allow-list of model ids.
#[derive(Debug, Clone)]
pub struct ModelPolicy {
    pub default_model: String,
    pub supported: Vec<String>,
}

impl ModelPolicy {
    pub fn from_config(cfg: &GatewayConfig) -> Self {
        Self {
            default_model: cfg.default_model.clone(),
            supported: cfg.supported_models.clone(),
        }
    }

    /// Resolve the requested model: empty → default, otherwise it must be allow-listed
    /// (case-insensitive).
    pub fn resolve(&self, requested: &str) -> Result<String, GatewayError> {
        let requested = requested.trim();
        if requested.is_empty() {
            return Ok(self.default_model.clone());
        }
        if self
            .supported
            .iter()
            .any(|m| m.eq_ignore_ascii_case(requested))
        {
            Ok(requested.to_string())
        } else {
            Err(GatewayError::Validation(format!(
                "Model '{}' is not supported. Supported models: {}",
                requested,
                self.supported.join(", ")
            )))
        }
    }
}

// ============================================================================
// Messages → backend
// ============================================================================

/// Convert a Messages request into the backend request shape.
///
/// This conversion maps:
/// - model → allow-listed model (default substituted when empty)
/// - system (string or blocks) → single `system` string
/// - messages[].content → messages[].parts, one part per content block
/// - tools → tools with `inputSchema` passed through verbatim
/// - max_tokens → maxOutputTokens
pub fn to_upstream_request(
    req: &msg::ChatRequest,
    policy: &ModelPolicy,
) -> Result<up::UpstreamRequest, GatewayError> {
    let model = policy.resolve(&req.model)?;

    let system = req
        .system
        .as_ref()
        .map(|s| s.merged())
        .filter(|s| !s.is_empty());

    Ok(up::UpstreamRequest {
        model,
        system,
        messages: map_messages(&req.messages),
        tools: req
            .tools
            .as_ref()
            .map(|tools| tools.iter().map(map_tool).collect()),
        max_output_tokens: req.max_tokens,
        temperature: req.temperature,
        stop_sequences: req.stop_sequences.clone(),
        trigger: up::SUBMIT_TRIGGER.to_string(),
    })
}

fn map_messages(src: &[msg::ChatMessage]) -> Vec<up::UpstreamMessage> {
    src.iter()
        .enumerate()
        .map(|(idx, m)| up::UpstreamMessage {
            id: format!("msg-{}", idx),
            role: m.role,
            parts: m.content.to_blocks().iter().map(map_block).collect(),
        })
        .collect()
}

fn map_block(block: &msg::ContentBlock) -> up::UpstreamPart {
    match block {
        msg::ContentBlock::Text { text } => up::UpstreamPart::Text { text: text.clone() },
        msg::ContentBlock::Image { source } => map_image(source),
        msg::ContentBlock::ToolUse { id, name, input } => up::UpstreamPart::ToolCall {
            tool_call_id: id.clone(),
            tool_name: name.clone(),
            input: input.clone(),
        },
        msg::ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => up::UpstreamPart::ToolResult {
            tool_call_id: tool_use_id.clone(),
            output: content.as_ref().map(|c| match c {
                msg::ToolResultContent::Text(text) => up::UpstreamToolOutput::Text(text.clone()),
                msg::ToolResultContent::Blocks(blocks) => {
                    up::UpstreamToolOutput::Parts(blocks.iter().map(map_block).collect())
                }
            }),
            is_error: *is_error,
        },
    }
}

fn map_image(source: &msg::ImageSource) -> up::UpstreamPart {
    match source {
        msg::ImageSource::Base64 { media_type, data } => up::UpstreamPart::File {
            media_type: Some(media_type.clone()),
            url: format!("data:{};base64,{}", media_type, data),
        },
        msg::ImageSource::Url { url } => up::UpstreamPart::File {
            media_type: None,
            url: url.clone(),
        },
    }
}

fn map_tool(t: &msg::ToolDefinition) -> up::UpstreamTool {
    up::UpstreamTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.input_schema.clone(),
    }
}

// ============================================================================
// Backend → Messages (inverse mapping)
// ============================================================================

/// Rebuild a Messages request from a backend request.
///
/// Content always comes back in block form and the system prompt as merged text;
/// everything else matches the request `to_upstream_request` was given.
pub fn upstream_to_chat_request(req: &up::UpstreamRequest) -> msg::ChatRequest {
    msg::ChatRequest {
        model: req.model.clone(),
        max_tokens: req.max_output_tokens,
        messages: req
            .messages
            .iter()
            .map(|m| msg::ChatMessage {
                role: m.role,
                content: msg::MessageContent::Blocks(m.parts.iter().map(part_to_block).collect()),
            })
            .collect(),
        system: req.system.clone().map(msg::SystemPrompt::Text),
        tools: req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| msg::ToolDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    input_schema: t.input_schema.clone(),
                })
                .collect()
        }),
        stream: None,
        temperature: req.temperature,
        stop_sequences: req.stop_sequences.clone(),
    }
}

fn part_to_block(part: &up::UpstreamPart) -> msg::ContentBlock {
    match part {
        up::UpstreamPart::Text { text } => msg::ContentBlock::Text { text: text.clone() },
        up::UpstreamPart::File { media_type, url } => msg::ContentBlock::Image {
            source: file_to_image(media_type.as_deref(), url),
        },
        up::UpstreamPart::ToolCall {
            tool_call_id,
            tool_name,
            input,
        } => msg::ContentBlock::ToolUse {
            id: tool_call_id.clone(),
            name: tool_name.clone(),
            input: input.clone(),
        },
        up::UpstreamPart::ToolResult {
            tool_call_id,
            output,
            is_error,
        } => msg::ContentBlock::ToolResult {
            tool_use_id: tool_call_id.clone(),
            content: output.as_ref().map(|o| match o {
                up::UpstreamToolOutput::Text(text) => msg::ToolResultContent::Text(text.clone()),
                up::UpstreamToolOutput::Parts(parts) => {
                    msg::ToolResultContent::Blocks(parts.iter().map(part_to_block).collect())
                }
            }),
            is_error: *is_error,
        },
    }
}

fn file_to_image(media_type: Option<&str>, url: &str) -> msg::ImageSource {
    if let (Some(mt), Some(rest)) = (media_type, url.strip_prefix("data:")) {
        if let Some(data) = rest.strip_prefix(mt).and_then(|r| r.strip_prefix(";base64,")) {
            return msg::ImageSource::Base64 {
                media_type: mt.to_string(),
                data: data.to_string(),
            };
        }
    }
    msg::ImageSource::Url {
        url: url.to_string(),
    }
}

// ============================================================================
// Prompt rendering for input-token accounting
// ============================================================================

/// Everything in the request a model would read: system prompt, message text,
/// tool calls and results, and tool definitions.
pub fn render_prompt_text(req: &msg::ChatRequest) -> String {
    let mut pieces: Vec<String> = Vec::new();

    if let Some(system) = &req.system {
        pieces.push(system.merged());
    }

    for m in &req.messages {
        match &m.content {
            msg::MessageContent::Text(text) => pieces.push(text.clone()),
            msg::MessageContent::Blocks(blocks) => {
                for block in blocks {
                    render_block(block, &mut pieces);
                }
            }
        }
    }

    for tool in req.tools.iter().flatten() {
        pieces.push(tool.name.clone());
        if let Some(desc) = &tool.description {
            pieces.push(desc.clone());
        }
        pieces.push(tool.input_schema.to_string());
    }

    pieces.retain(|p| !p.is_empty());
    pieces.join("\n")
}

fn render_block(block: &msg::ContentBlock, out: &mut Vec<String>) {
    match block {
        msg::ContentBlock::Text { text } => out.push(text.clone()),
        msg::ContentBlock::Image { .. } => {}
        msg::ContentBlock::ToolUse { name, input, .. } => {
            out.push(name.clone());
            out.push(input.to_string());
        }
        msg::ContentBlock::ToolResult { content, .. } => match content {
            Some(msg::ToolResultContent::Text(text)) => out.push(text.clone()),
            Some(msg::ToolResultContent::Blocks(blocks)) => {
                for b in blocks {
                    render_block(b, out);
                }
            }
            None => {}
        },
    }
}
