//! Tool and JSON-Schema processing for the upstream payload.

use kirogate_core::{GatewayError, Result};
use serde_json::{json, Map, Value};

/// Upstream rejects tool names longer than this many bytes.
pub const MAX_TOOL_NAME_BYTES: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Strip schema constructs the upstream rejects: empty `required` arrays and
/// `additionalProperties` at any nesting depth. Returns a new value; the
/// input is untouched.
pub fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                if key == "additionalProperties" {
                    continue;
                }
                if key == "required" && value.as_array().is_some_and(|a| a.is_empty()) {
                    continue;
                }
                out.insert(key.clone(), sanitize_schema(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

/// Move oversized tool descriptions into a system-prompt addendum.
///
/// Each tool whose description exceeds `limit` bytes gets a short reference
/// string instead; the full text is returned as a Markdown section to be
/// appended to the system prompt. `limit == 0` disables the rewrite.
pub fn process_long_descriptions(tools: &[UnifiedTool], limit: usize) -> (Vec<UnifiedTool>, String) {
    if limit == 0 {
        return (tools.to_vec(), String::new());
    }

    let mut processed = Vec::with_capacity(tools.len());
    let mut addendum = String::new();

    for tool in tools {
        if tool.description.len() > limit {
            addendum.push_str(&format!(
                "\n\n## Tool: {}\n\n{}",
                tool.name, tool.description
            ));
            processed.push(UnifiedTool {
                name: tool.name.clone(),
                description: format!(
                    "[Full documentation in system prompt under '## Tool: {}']",
                    tool.name
                ),
                input_schema: tool.input_schema.clone(),
            });
        } else {
            processed.push(tool.clone());
        }
    }

    (processed, addendum)
}

/// Reject tools whose names exceed the upstream byte limit, listing every
/// offender with its length. Never modifies the input.
pub fn validate_tool_names(tools: &[UnifiedTool]) -> Result<()> {
    let offenders: Vec<String> = tools
        .iter()
        .filter(|t| t.name.len() > MAX_TOOL_NAME_BYTES)
        .map(|t| format!("{} ({} bytes)", t.name, t.name.len()))
        .collect();

    if offenders.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::ToolNameTooLong { names: offenders })
    }
}

/// Emit the upstream tool shape. Empty descriptions are replaced with a
/// generic `Tool: <name>` label (the upstream rejects blank descriptions).
pub fn convert_tools(tools: &[UnifiedTool]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let description = if tool.description.trim().is_empty() {
                format!("Tool: {}", tool.name)
            } else {
                tool.description.clone()
            };
            json!({
                "toolSpecification": {
                    "name": tool.name,
                    "description": description,
                    "inputSchema": { "json": sanitize_schema(&tool.input_schema) },
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, description: &str) -> UnifiedTool {
        UnifiedTool {
            name: name.into(),
            description: description.into(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    #[test]
    fn sanitize_removes_additional_properties_at_depth() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "nested": {
                    "type": "object",
                    "additionalProperties": true,
                    "properties": {
                        "leaf": {"type": "string"}
                    }
                }
            }
        });
        let cleaned = sanitize_schema(&schema);
        assert!(cleaned.get("additionalProperties").is_none());
        assert!(cleaned["properties"]["nested"]
            .get("additionalProperties")
            .is_none());
        assert_eq!(
            cleaned["properties"]["nested"]["properties"]["leaf"]["type"],
            "string"
        );
    }

    #[test]
    fn sanitize_drops_empty_required_keeps_populated() {
        let schema = json!({
            "required": [],
            "properties": {
                "inner": {"required": ["a"], "items": [{"required": []}]}
            }
        });
        let cleaned = sanitize_schema(&schema);
        assert!(cleaned.get("required").is_none());
        assert_eq!(cleaned["properties"]["inner"]["required"], json!(["a"]));
        assert!(cleaned["properties"]["inner"]["items"][0]
            .get("required")
            .is_none());
    }

    #[test]
    fn sanitize_is_idempotent() {
        let schema = json!({
            "type": "object",
            "additionalProperties": false,
            "required": [],
            "properties": {"x": {"type": "number", "required": ["y"]}}
        });
        let once = sanitize_schema(&schema);
        let twice = sanitize_schema(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn sanitize_does_not_mutate_input() {
        let schema = json!({"additionalProperties": false});
        let _ = sanitize_schema(&schema);
        assert!(schema.get("additionalProperties").is_some());
    }

    #[test]
    fn long_descriptions_move_to_addendum() {
        let long = "x".repeat(100);
        let tools = vec![tool("big_tool", &long), tool("small_tool", "short")];
        let (processed, addendum) = process_long_descriptions(&tools, 50);

        assert_eq!(
            processed[0].description,
            "[Full documentation in system prompt under '## Tool: big_tool']"
        );
        assert_eq!(processed[1].description, "short");
        assert!(addendum.contains("## Tool: big_tool"));
        assert!(addendum.contains(&long));
        assert!(!addendum.contains("small_tool"));
    }

    #[test]
    fn zero_limit_disables_rewrite() {
        let tools = vec![tool("t", &"x".repeat(10_000))];
        let (processed, addendum) = process_long_descriptions(&tools, 0);
        assert_eq!(processed[0].description.len(), 10_000);
        assert!(addendum.is_empty());
    }

    #[test]
    fn name_validation_lists_every_offender() {
        let ok = tool("fine", "d");
        let long_a = tool(&"a".repeat(70), "d");
        let long_b = tool(&"b".repeat(65), "d");
        let err = validate_tool_names(&[ok, long_a, long_b]).unwrap_err();
        match err {
            GatewayError::ToolNameTooLong { names } => {
                assert_eq!(names.len(), 2);
                assert!(names[0].contains("(70 bytes)"));
                assert!(names[1].contains("(65 bytes)"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn name_validation_uses_bytes_not_chars() {
        // 33 two-byte characters: 33 chars, 66 bytes
        let name = "é".repeat(33);
        let err = validate_tool_names(&[tool(&name, "d")]).unwrap_err();
        assert!(matches!(err, GatewayError::ToolNameTooLong { .. }));
    }

    #[test]
    fn convert_emits_tool_specification_shape() {
        let converted = convert_tools(&[tool("get_weather", "Fetch weather")]);
        assert_eq!(
            converted[0]["toolSpecification"]["name"],
            "get_weather"
        );
        assert_eq!(
            converted[0]["toolSpecification"]["description"],
            "Fetch weather"
        );
        assert!(converted[0]["toolSpecification"]["inputSchema"]["json"].is_object());
    }

    #[test]
    fn convert_fills_empty_descriptions() {
        let converted = convert_tools(&[tool("bare", "")]);
        assert_eq!(
            converted[0]["toolSpecification"]["description"],
            "Tool: bare"
        );
    }
}
