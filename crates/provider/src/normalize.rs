use crate::types::{RawToolCall, ToolCall};

/// Normalize provider tool calls into the single shape the registry sees:
/// arguments as a JSON map, id always present.
///
/// Providers that encode arguments as JSON-in-a-string are parsed here;
/// arguments that fail to parse surface as `{"_raw": "<text>"}` so the
/// registry can produce an actionable schema error instead of a panic.
pub fn normalize_tool_calls(raw: Vec<RawToolCall>) -> Vec<ToolCall> {
    raw.into_iter().map(normalize_one).collect()
}

fn normalize_one(call: RawToolCall) -> ToolCall {
    let arguments = parse_arguments(&call.arguments);
    let id = call
        .id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(generate_call_id);
    ToolCall {
        id,
        name: call.name,
        arguments,
    }
}

fn parse_arguments(raw: &str) -> serde_json::Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return serde_json::json!({});
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
        // Some providers double-encode: a JSON string containing JSON.
        Ok(serde_json::Value::String(inner)) => match serde_json::from_str(&inner) {
            Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
            _ => serde_json::json!({ "_raw": inner }),
        },
        _ => serde_json::json!({ "_raw": trimmed }),
    }
}

pub fn generate_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: Option<&str>, args: &str) -> RawToolCall {
        RawToolCall {
            id: id.map(String::from),
            name: "write_file".into(),
            arguments: args.into(),
        }
    }

    #[test]
    fn json_string_arguments_become_a_map() {
        let calls = normalize_tool_calls(vec![raw(Some("c1"), r#"{"path":"a.rs","content":"x"}"#)]);
        assert_eq!(calls[0].arguments["path"], "a.rs");
        assert_eq!(calls[0].id, "c1");
    }

    #[test]
    fn double_encoded_arguments_unwrap() {
        let calls = normalize_tool_calls(vec![raw(
            Some("c1"),
            r#""{\"path\":\"a.rs\"}""#,
        )]);
        assert_eq!(calls[0].arguments["path"], "a.rs");
    }

    #[test]
    fn missing_id_is_generated_unique() {
        let calls = normalize_tool_calls(vec![raw(None, "{}"), raw(Some(""), "{}")]);
        assert!(calls[0].id.starts_with("call_"));
        assert!(calls[1].id.starts_with("call_"));
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn unparseable_arguments_survive_as_raw() {
        let calls = normalize_tool_calls(vec![raw(Some("c1"), "not json at all")]);
        assert_eq!(calls[0].arguments["_raw"], "not json at all");
    }

    #[test]
    fn empty_arguments_become_empty_map() {
        let calls = normalize_tool_calls(vec![raw(Some("c1"), "  ")]);
        assert_eq!(calls[0].arguments, serde_json::json!({}));
    }
}
