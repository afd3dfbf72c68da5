//! Tool definitions, tool choice and tool-call grammars.
//!
//! A call is the JSON object `{"name": "<tool>", "arguments": {...}}` with the
//! arguments constrained by the tool's parameter schema. Parallel calls are a
//! JSON array of calls.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{gbnf_literal, json_literal, SchemaConverter};
use crate::{checked, ChatError, ChatOptions, Result};

fn empty_parameters() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Function description inside a tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
}

/// OpenAI-style tool definition: `{"type": "function", "function": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

impl Tool {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            kind: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: Some(description.into()),
                parameters,
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.function.name
    }
}

/// Parse and validate a JSON tool list.
pub fn parse_tools(json: &str) -> Result<Vec<Tool>> {
    let tools: Vec<Tool> = serde_json::from_str(json).map_err(|e| ChatError::Tools(e.to_string()))?;
    validate_tools(&tools)?;
    Ok(tools)
}

pub(crate) fn validate_tools(tools: &[Tool]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for tool in tools {
        if tool.kind != "function" {
            return Err(ChatError::Tools(format!("unsupported tool type '{}'", tool.kind)));
        }
        if tool.name().is_empty() {
            return Err(ChatError::Tools("tool name is empty".to_string()));
        }
        if !seen.insert(tool.name()) {
            return Err(ChatError::Tools(format!("duplicate tool '{}'", tool.name())));
        }
        if !tool.function.parameters.is_object() {
            return Err(ChatError::Tools(format!(
                "parameters of '{}' must be a schema object",
                tool.name()
            )));
        }
    }
    Ok(())
}

/// How the model may use the supplied tools.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// Free text or a tool call.
    #[default]
    Auto,
    /// Must call some tool.
    Required,
    /// Tools are ignored.
    None,
    /// Must call this tool.
    Named(String),
}

impl FromStr for ToolChoice {
    type Err = ChatError;

    /// Accepts `auto`, `required`, `none`, a bare tool name, or
    /// `{"type":"function","function":{"name":..}}`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "" | "auto" => Ok(Self::Auto),
            "required" => Ok(Self::Required),
            "none" => Ok(Self::None),
            object if object.starts_with('{') => {
                let value: Value =
                    serde_json::from_str(object).map_err(|e| ChatError::Tools(e.to_string()))?;
                value
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .map(|name| Self::Named(name.to_string()))
                    .ok_or_else(|| ChatError::Tools(format!("invalid tool_choice {}", object)))
            }
            name => Ok(Self::Named(name.to_string())),
        }
    }
}

impl fmt::Display for ToolChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Required => f.write_str("required"),
            Self::None => f.write_str("none"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Grammar for the reply given tools and tool choice, if any applies.
pub(crate) fn tool_grammar(options: &ChatOptions) -> Result<Option<String>> {
    if options.tools.is_empty() || options.tool_choice == ToolChoice::None {
        return Ok(None);
    }
    validate_tools(&options.tools)?;

    let selected: Vec<&Tool> = match &options.tool_choice {
        ToolChoice::Named(name) => {
            let tool = options
                .tools
                .iter()
                .find(|t| t.name() == name)
                .ok_or_else(|| ChatError::Tools(format!("tool_choice names unknown tool '{}'", name)))?;
            vec![tool]
        }
        _ => options.tools.iter().collect(),
    };

    let mut converter = SchemaConverter::new();
    let ws = converter.primitive("ws");
    let mut calls = Vec::with_capacity(selected.len());
    for (i, tool) in selected.iter().enumerate() {
        let scope = format!("tool{}-", i);
        converter.set_root(&tool.function.parameters, &scope);
        let args = converter.visit(&tool.function.parameters, &format!("{}args", scope))?;
        let body = format!(
            "\"{{\" {ws} {} {ws} \":\" {ws} {} {ws} \",\" {ws} {} {ws} \":\" {ws} {args} {ws} \"}}\"",
            gbnf_literal("\"name\""),
            json_literal(&Value::String(tool.name().to_string())),
            gbnf_literal("\"arguments\""),
        );
        calls.push(converter.add_rule(&format!("{}call", scope), body));
    }
    let call = converter.add_rule("tool-call", calls.join(" | "));
    let reply = if options.parallel_tool_calls {
        converter.add_rule(
            "tool-calls",
            format!("\"[\" {ws} {call} ( {ws} \",\" {ws} {call} )* {ws} \"]\""),
        )
    } else {
        call
    };

    let root = match options.tool_choice {
        ToolChoice::Auto => {
            let text = converter.add_rule("free-text", r#"[^{\[] .*"#.to_string());
            converter.add_rule("root", format!("{} | {}", reply, text))
        }
        _ => converter.add_rule("root", reply),
    };
    Ok(Some(checked(converter.finish(&root)?)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cactus_sampling::{Grammar, GrammarMatcher};
    use serde_json::json;

    fn weather() -> Tool {
        Tool::function(
            "get_weather",
            "Current weather",
            json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"]
            }),
        )
    }

    fn clock() -> Tool {
        Tool::function("get_time", "Current time", json!({"type": "object", "properties": {}}))
    }

    fn accepts(grammar: &str, input: &str) -> bool {
        let mut m = GrammarMatcher::new(Grammar::parse(grammar).unwrap());
        m.accept_str(input) && m.is_accepting()
    }

    fn grammar_for(choice: ToolChoice, parallel: bool) -> String {
        let options = ChatOptions::default()
            .with_tools(vec![weather(), clock()])
            .with_tool_choice(choice)
            .with_parallel_tool_calls(parallel);
        tool_grammar(&options).unwrap().unwrap()
    }

    #[test]
    fn parse_tool_list() {
        let tools = parse_tools(
            r#"[{"type":"function","function":{"name":"f","description":"d","parameters":{"type":"object"}}}]"#,
        )
        .unwrap();
        assert_eq!(tools[0].name(), "f");

        let defaulted = parse_tools(r#"[{"type":"function","function":{"name":"g"}}]"#).unwrap();
        assert!(defaulted[0].function.parameters.is_object());
    }

    #[test]
    fn parse_tool_list_fails_closed() {
        assert!(parse_tools("{").is_err());
        assert!(parse_tools(r#"[{"type":"retrieval","function":{"name":"f"}}]"#).is_err());
        assert!(parse_tools(r#"[{"type":"function","function":{"name":""}}]"#).is_err());
        assert!(parse_tools(
            r#"[{"type":"function","function":{"name":"f","parameters":"x"}}]"#
        )
        .is_err());
        assert!(parse_tools(
            r#"[{"type":"function","function":{"name":"f"}},{"type":"function","function":{"name":"f"}}]"#
        )
        .is_err());
    }

    #[test]
    fn tool_choice_parsing() {
        assert_eq!("auto".parse::<ToolChoice>().unwrap(), ToolChoice::Auto);
        assert_eq!("".parse::<ToolChoice>().unwrap(), ToolChoice::Auto);
        assert_eq!("required".parse::<ToolChoice>().unwrap(), ToolChoice::Required);
        assert_eq!("none".parse::<ToolChoice>().unwrap(), ToolChoice::None);
        assert_eq!(
            r#"{"type":"function","function":{"name":"get_time"}}"#
                .parse::<ToolChoice>()
                .unwrap(),
            ToolChoice::Named("get_time".to_string())
        );
        assert!(r#"{"type":"function"}"#.parse::<ToolChoice>().is_err());
    }

    #[test]
    fn required_forces_a_call() {
        let g = grammar_for(ToolChoice::Required, false);
        assert!(accepts(&g, r#"{"name": "get_weather", "arguments": {"city": "Oslo"}}"#));
        assert!(accepts(&g, r#"{"name":"get_time","arguments":{}}"#));
        assert!(!accepts(&g, "It is sunny."));
        assert!(!accepts(&g, r#"{"name":"get_weather","arguments":{}}"#));
    }

    #[test]
    fn auto_allows_text_or_call() {
        let g = grammar_for(ToolChoice::Auto, false);
        assert!(accepts(&g, "It is sunny."));
        assert!(accepts(&g, r#"{"name":"get_time","arguments":{}}"#));
        assert!(!accepts(&g, r#"{"name":"unknown","arguments":{}}"#));
    }

    #[test]
    fn named_restricts_to_one_tool() {
        let g = grammar_for(ToolChoice::Named("get_time".to_string()), false);
        assert!(accepts(&g, r#"{"name":"get_time","arguments":{}}"#));
        assert!(!accepts(&g, r#"{"name":"get_weather","arguments":{"city":"x"}}"#));

        let options = ChatOptions::default()
            .with_tools(vec![weather()])
            .with_tool_choice(ToolChoice::Named("nope".to_string()));
        assert!(matches!(tool_grammar(&options), Err(ChatError::Tools(_))));
    }

    #[test]
    fn parallel_calls_are_an_array() {
        let g = grammar_for(ToolChoice::Required, true);
        assert!(accepts(
            &g,
            r#"[{"name":"get_time","arguments":{}}, {"name":"get_weather","arguments":{"city":"Rome"}}]"#
        ));
        assert!(!accepts(&g, r#"{"name":"get_time","arguments":{}}"#));
    }

    #[test]
    fn none_or_empty_tools_produce_no_grammar() {
        let options = ChatOptions::default()
            .with_tools(vec![weather()])
            .with_tool_choice(ToolChoice::None);
        assert!(tool_grammar(&options).unwrap().is_none());
        assert!(tool_grammar(&ChatOptions::default()).unwrap().is_none());
    }
}
