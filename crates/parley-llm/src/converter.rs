use serde_json::{json, Value};

use parley_core::provider::{ModelRequest, ThinkingConfig};
use parley_core::transcript::{AssistantTurn, Segment, ToolResultTurn, Turn, UserTurn};

/// Convert a model request into the Anthropic Messages API request body.
pub fn build_request_body(request: &ModelRequest, model: &str) -> Value {
    let options = &request.options;
    let mut body = json!({
        "model": model,
        "stream": true,
        "max_tokens": options.max_tokens,
    });

    match &options.thinking {
        ThinkingConfig::Disabled => {
            if let Some(temp) = options.temperature {
                body["temperature"] = json!(temp);
            }
        }
        // The API rejects a custom temperature while thinking is enabled.
        ThinkingConfig::Budget { tokens } => {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": tokens});
        }
    }

    if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.is_empty()) {
        body["system"] = json!([{"type": "text", "text": system}]);
    }

    body["messages"] = json!(convert_turns(&request.turns));

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }

    body
}

/// Convert transcript turns into API messages. Tool results travel in user
/// messages, and consecutive user-role content is merged so roles alternate.
fn convert_turns(turns: &[Turn]) -> Vec<Value> {
    let mut result: Vec<Value> = Vec::new();

    for turn in turns {
        let (role, blocks) = match turn {
            Turn::User(user) => ("user", convert_user_turn(user)),
            Turn::Assistant(asst) => ("assistant", convert_assistant_turn(asst)),
            Turn::ToolResult(tr) => ("user", vec![convert_tool_result(tr)]),
        };
        if blocks.is_empty() {
            continue;
        }
        let same_role = matches!(result.last(), Some(prev) if prev["role"] == role);
        match result.last_mut().and_then(|m| m["content"].as_array_mut()) {
            Some(content) if same_role => content.extend(blocks),
            _ => result.push(json!({"role": role, "content": blocks})),
        }
    }

    // Cache breakpoint on the last user content block.
    if let Some(last_user) = result.iter_mut().rev().find(|m| m["role"] == "user") {
        if let Some(last_block) = last_user["content"].as_array_mut().and_then(|c| c.last_mut()) {
            last_block["cache_control"] = json!({"type": "ephemeral"});
        }
    }

    result
}

fn convert_user_turn(turn: &UserTurn) -> Vec<Value> {
    vec![json!({"type": "text", "text": turn.rendered_text()})]
}

fn convert_assistant_turn(turn: &AssistantTurn) -> Vec<Value> {
    turn.segments
        .iter()
        .filter_map(|s| match s {
            Segment::Text { text } if text.is_empty() => None,
            Segment::Text { text } => Some(json!({"type": "text", "text": text})),
            // Only include thinking blocks that have a signature
            Segment::Thinking { text, signature } => signature.as_ref().map(|sig| {
                json!({
                    "type": "thinking",
                    "thinking": text,
                    "signature": sig,
                })
            }),
            Segment::ToolCall(tc) => Some(json!({
                "type": "tool_use",
                "id": tc.call_id.as_str(),
                "name": tc.tool_name,
                "input": tc.arguments,
            })),
        })
        .collect()
}

fn convert_tool_result(turn: &ToolResultTurn) -> Value {
    let mut content = vec![json!({"type": "text", "text": turn.content})];
    for artifact in &turn.artifacts {
        if artifact.media_type.starts_with("image/") {
            content.push(json!({
                "type": "image",
                "source": {"type": "base64", "media_type": artifact.media_type, "data": artifact.data},
            }));
        }
    }

    let mut block = json!({
        "type": "tool_result",
        "tool_use_id": turn.call_id.as_str(),
        "content": content,
    });
    if turn.outcome.is_error() {
        block["is_error"] = json!(true);
    }
    block
}
