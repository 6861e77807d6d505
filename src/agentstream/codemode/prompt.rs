//! System-prompt addenda published by the codemode processor.

use crate::agentstream::codemode::sandbox::RegisteredTool;

/// `source` value of the base addendum.
pub const BASE_PROMPT_SOURCE: &str = "codemode";

const TOOL_SOURCE_PREFIX: &str = "codemode:tool:";

/// `source` value of a per-tool addendum.
pub fn tool_prompt_source(name: &str) -> String {
    format!("{}{}", TOOL_SOURCE_PREFIX, name)
}

/// The tool name back out of a per-tool `source`, if it is one.
pub fn tool_name_from_source(source: &str) -> Option<&str> {
    source.strip_prefix(TOOL_SOURCE_PREFIX)
}

/// The base addendum, published once per path.
pub fn base_prompt() -> String {
    "\
You can run code by wrapping it in <codemode></codemode> markers. The code \
must define an async function named `codemode` taking no parameters; its \
return value is reported back to you as a developer message. Inside the \
function you can use `console`, `fetch`, `exec`, `env`, `require` and \
`emit(event)`. Events passed to `emit` are appended to the session log \
after your code finishes. Registered tools are available as top-level \
async functions of one argument. Results arrive asynchronously; do not \
repeat a codemode block while you are waiting for its result."
        .to_string()
}

/// The addendum describing one registered tool, published once per tool
/// name per path.
pub fn tool_prompt(tool: &RegisteredTool) -> String {
    let mut prompt = format!(
        "Tool `{}` is available inside codemode blocks: {}\nParameters (JSON schema): {}",
        tool.name, tool.description, tool.parameters_json_schema
    );
    if let Some(returns) = &tool.return_description {
        prompt.push_str("\nReturns: ");
        prompt.push_str(returns);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_source_round_trip() {
        let source = tool_prompt_source("fetchWeather");
        assert_eq!(source, "codemode:tool:fetchWeather");
        assert_eq!(tool_name_from_source(&source), Some("fetchWeather"));
        assert_eq!(tool_name_from_source(BASE_PROMPT_SOURCE), None);
    }

    #[test]
    fn test_tool_prompt_mentions_name_and_schema() {
        let tool = RegisteredTool {
            name: "fetchWeather".to_string(),
            description: "Looks up the weather.".to_string(),
            parameters_json_schema: serde_json::json!({"type": "object"}),
            return_description: Some("A weather report.".to_string()),
            implementation: String::new(),
        };
        let prompt = tool_prompt(&tool);
        assert!(prompt.contains("fetchWeather"));
        assert!(prompt.contains("\"object\""));
        assert!(prompt.contains("A weather report."));
    }
}
