//! # cactus-chat
//!
//! Turns structured chat messages into a model prompt.
//!
//! This crate provides:
//! - [`ChatMessage`] and JSON message parsing (string or text-part content)
//! - One capability, [`ChatFormatter`], with two strategies:
//!   [`BuiltinTemplate`] (known template families) and [`JinjaTemplate`]
//!   (template-engine rendering with tools and tool choice)
//! - JSON schema to GBNF grammar conversion ([`json_schema_to_grammar`])
//! - Tool-call grammars for auto / required / named tool choice
//!
//! Every grammar produced here is parsed by `cactus-sampling` before it is
//! returned, so a malformed schema or tool list fails before generation.

pub mod builtin;
pub mod jinja;
pub mod schema;
pub mod tools;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use cactus_sampling::{Grammar, GrammarError};

pub use builtin::BuiltinTemplate;
pub use jinja::JinjaTemplate;
pub use schema::json_schema_to_grammar;
pub use tools::{parse_tools, Tool, ToolChoice, ToolFunction};

pub type Result<T> = std::result::Result<T, ChatError>;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("Invalid chat messages: {0}")]
    InvalidMessages(String),
    #[error("Unsupported chat template: {0}")]
    UnsupportedTemplate(String),
    #[error("Template error: {0}")]
    Template(String),
    #[error("Invalid JSON schema: {0}")]
    Schema(String),
    #[error("Invalid tools: {0}")]
    Tools(String),
    #[error("Generated grammar rejected: {0}")]
    Grammar(#[from] GrammarError),
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A tool invocation recorded on an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A chat message with role and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, deserialize_with = "deserialize_content")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::new("tool", content)
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Content is a string, null, or an array of `{"type":"text","text":..}` parts.
fn deserialize_content<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    match Option::<Content>::deserialize(d)? {
        None => Ok(String::new()),
        Some(Content::Text(text)) => Ok(text),
        Some(Content::Parts(parts)) => {
            let mut out = String::new();
            for part in parts {
                match (part.kind.as_str(), part.text) {
                    ("text", Some(text)) => out.push_str(&text),
                    (kind, _) => {
                        return Err(D::Error::custom(format!(
                            "unsupported content part '{}'",
                            kind
                        )))
                    }
                }
            }
            Ok(out)
        }
    }
}

/// Parse the JSON wire form `[{"role": .., "content": ..}, ...]`.
pub fn parse_messages(json: &str) -> Result<Vec<ChatMessage>> {
    let messages: Vec<ChatMessage> =
        serde_json::from_str(json).map_err(|e| ChatError::InvalidMessages(e.to_string()))?;
    if let Some(i) = messages.iter().position(|m| m.role.trim().is_empty()) {
        return Err(ChatError::InvalidMessages(format!(
            "message {} has an empty role",
            i
        )));
    }
    Ok(messages)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Which rendering strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    #[default]
    Builtin,
    Jinja,
}

/// Inputs beyond the messages themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub add_generation_prompt: bool,
    pub bos_token: String,
    pub eos_token: String,
    pub json_schema: Option<serde_json::Value>,
    pub tools: Vec<Tool>,
    pub tool_choice: ToolChoice,
    pub parallel_tool_calls: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            add_generation_prompt: true,
            bos_token: String::new(),
            eos_token: String::new(),
            json_schema: None,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            parallel_tool_calls: false,
        }
    }
}

impl ChatOptions {
    pub fn with_special_tokens(mut self, bos: impl Into<String>, eos: impl Into<String>) -> Self {
        self.bos_token = bos.into();
        self.eos_token = eos.into();
        self
    }

    pub fn with_json_schema(mut self, schema: serde_json::Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_parallel_tool_calls(mut self, parallel: bool) -> Self {
        self.parallel_tool_calls = parallel;
        self
    }

    pub fn without_generation_prompt(mut self) -> Self {
        self.add_generation_prompt = false;
        self
    }
}

/// Which strategy produced a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFormat {
    Builtin(BuiltinTemplate),
    Jinja,
}

/// A rendered prompt plus the constraints that go with it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPrompt {
    pub prompt: String,
    /// GBNF grammar for the reply (from a JSON schema or tools).
    pub grammar: Option<String>,
    /// Template-specific end-of-turn strings to add to the stop list.
    pub additional_stops: Vec<String>,
    pub format: ChatFormat,
}

/// Renders messages into a prompt.
pub trait ChatFormatter: Send + Sync {
    fn render(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatPrompt>;
}

/// Pick a strategy for a template source.
///
/// `source` is the caller override if any, otherwise the model's embedded
/// template.
pub fn resolve_formatter(kind: TemplateKind, source: Option<&str>) -> Result<Box<dyn ChatFormatter>> {
    match kind {
        TemplateKind::Builtin => Ok(Box::new(BuiltinTemplate::resolve(source)?)),
        TemplateKind::Jinja => Ok(Box::new(JinjaTemplate::new(source)?)),
    }
}

/// Whether a template source can be used with the given strategy.
pub fn validate_template(kind: TemplateKind, source: Option<&str>) -> bool {
    resolve_formatter(kind, source).is_ok()
}

/// Grammar constraining the reply: the tool-call grammar when tools apply,
/// the JSON schema grammar otherwise. Tools are validated even when the
/// choice is `none`.
pub(crate) fn reply_grammar(options: &ChatOptions) -> Result<Option<String>> {
    if !options.tools.is_empty() && options.json_schema.is_some() {
        return Err(ChatError::Tools(
            "a JSON schema cannot be combined with tools".to_string(),
        ));
    }
    tools::validate_tools(&options.tools)?;
    match tools::tool_grammar(options)? {
        Some(grammar) => Ok(Some(grammar)),
        None => schema_grammar(options),
    }
}

/// Grammar for a JSON schema alone, validated.
pub(crate) fn schema_grammar(options: &ChatOptions) -> Result<Option<String>> {
    match &options.json_schema {
        Some(schema) => Ok(Some(checked(json_schema_to_grammar(schema)?)?)),
        None => Ok(None),
    }
}

/// Parse a produced grammar before handing it out.
pub(crate) fn checked(grammar: String) -> Result<String> {
    Grammar::parse(&grammar)?;
    Ok(grammar)
}
