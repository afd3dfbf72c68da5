//! Template-engine rendering for model-supplied chat templates.

use std::sync::Arc;

use chrono::format::{Item, StrftimeItems};
use minijinja::{context, Environment, ErrorKind};

use crate::tools::ToolChoice;
use crate::{reply_grammar, ChatError, ChatFormat, ChatFormatter, ChatMessage, ChatOptions, ChatPrompt, Result};

/// ChatML layout used when no template source is supplied. Tools are listed
/// in a leading system turn.
pub const DEFAULT_CHATML_JINJA: &str = r##"{%- if tools -%}
{{- '<|im_start|>system\nYou may call a tool by replying with {"name": <tool name>, "arguments": <arguments object>}. Available tools:\n' -}}
{%- for tool in tools -%}{{- tool.function | tojson ~ '\n' -}}{%- endfor -%}
{{- '<|im_end|>\n' -}}
{%- endif -%}
{%- for message in messages -%}
{{- '<|im_start|>' ~ message.role ~ '\n' ~ message.content ~ '<|im_end|>\n' -}}
{%- endfor -%}
{%- if add_generation_prompt -%}{{- '<|im_start|>assistant\n' -}}{%- endif -%}"##;

/// End-of-turn markers recognized in template sources.
const STOP_MARKERS: &[&str] = &["<|im_end|>", "<|eot_id|>", "<|end|>", "<end_of_turn>", "</s>"];

/// A compiled-on-demand Jinja chat template.
pub struct JinjaTemplate {
    env: Environment<'static>,
    source: Arc<str>,
}

impl JinjaTemplate {
    /// Validate `source` (or the default ChatML template) and wrap it.
    pub fn new(source: Option<&str>) -> Result<Self> {
        let source: Arc<str> = Arc::from(source.unwrap_or(DEFAULT_CHATML_JINJA));
        let env = environment();
        env.template_from_str(&source)
            .map_err(|e| ChatError::Template(e.to_string()))?;
        Ok(Self { env, source })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// End-of-turn markers the template emits.
    pub fn stop_sequences(&self) -> Vec<String> {
        STOP_MARKERS
            .iter()
            .filter(|m| self.source.contains(*m))
            .map(|m| m.to_string())
            .collect()
    }

    pub fn apply(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String> {
        let tools = if options.tools.is_empty() || options.tool_choice == ToolChoice::None {
            None
        } else {
            Some(&options.tools)
        };
        let ctx = context! {
            messages => messages,
            bos_token => options.bos_token,
            eos_token => options.eos_token,
            add_generation_prompt => options.add_generation_prompt,
            tools => tools,
            tool_choice => options.tool_choice.to_string(),
            parallel_tool_calls => options.parallel_tool_calls,
        };
        self.env
            .render_str(&self.source, ctx)
            .map_err(|e| ChatError::Template(e.to_string()))
    }
}

impl ChatFormatter for JinjaTemplate {
    fn render(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatPrompt> {
        let grammar = reply_grammar(options)?;
        Ok(ChatPrompt {
            prompt: self.apply(messages, options)?,
            grammar,
            additional_stops: self.stop_sequences(),
            format: ChatFormat::Jinja,
        })
    }
}

impl Clone for JinjaTemplate {
    fn clone(&self) -> Self {
        Self {
            env: environment(),
            source: Arc::clone(&self.source),
        }
    }
}

impl std::fmt::Debug for JinjaTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JinjaTemplate").field("source", &self.source).finish()
    }
}

fn environment() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_keep_trailing_newline(true);
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_function("raise_exception", raise_exception);
    env.add_function("strftime_now", strftime_now);
    env
}

fn raise_exception(message: String) -> std::result::Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
}

fn strftime_now(format: String) -> std::result::Result<String, minijinja::Error> {
    let items: Vec<Item<'_>> = StrftimeItems::new(&format).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(minijinja::Error::new(
            ErrorKind::InvalidOperation,
            format!("invalid strftime format '{}'", format),
        ));
    }
    Ok(chrono::Local::now().format_with_items(items.iter()).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tool;
    use serde_json::json;

    #[test]
    fn default_template_is_chatml() {
        let t = JinjaTemplate::new(None).unwrap();
        let out = t
            .apply(
                &[ChatMessage::system("S"), ChatMessage::user("U")],
                &ChatOptions::default(),
            )
            .unwrap();
        assert_eq!(
            out,
            "<|im_start|>system\nS<|im_end|>\n<|im_start|>user\nU<|im_end|>\n<|im_start|>assistant\n"
        );
        assert_eq!(t.stop_sequences(), vec!["<|im_end|>".to_string()]);
    }

    #[test]
    fn custom_template_sees_special_tokens() {
        let t = JinjaTemplate::new(Some(
            "{{ bos_token }}{% for m in messages %}[{{ m.role }}]{{ m.content }}{% endfor %}{{ eos_token }}",
        ))
        .unwrap();
        let out = t
            .apply(
                &[ChatMessage::user("hi")],
                &ChatOptions::default().with_special_tokens("<s>", "</s>"),
            )
            .unwrap();
        assert_eq!(out, "<s>[user]hi</s>");
    }

    #[test]
    fn syntax_errors_are_rejected_at_construction() {
        assert!(matches!(
            JinjaTemplate::new(Some("{% for m in messages %}")),
            Err(ChatError::Template(_))
        ));
    }

    #[test]
    fn raise_exception_fails_render() {
        let t = JinjaTemplate::new(Some("{{ raise_exception('roles must alternate') }}")).unwrap();
        let err = t.apply(&[], &ChatOptions::default()).unwrap_err();
        assert!(err.to_string().contains("roles must alternate"));
    }

    #[test]
    fn strftime_now_formats_current_year() {
        let t = JinjaTemplate::new(Some("{{ strftime_now('%Y') }}")).unwrap();
        let out = t.apply(&[], &ChatOptions::default()).unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn tools_are_listed_and_constrained() {
        let tool = Tool::function("lookup", "Find a word", json!({"type": "object", "properties": {"q": {"type": "string"}}, "required": ["q"]}));
        let options = ChatOptions::default()
            .with_tools(vec![tool])
            .with_tool_choice(ToolChoice::Required);
        let prompt = JinjaTemplate::new(None)
            .unwrap()
            .render(&[ChatMessage::user("define cactus")], &options)
            .unwrap();
        assert!(prompt.prompt.contains("\"name\":\"lookup\""));
        assert!(prompt.grammar.unwrap().starts_with("root ::="));
        assert_eq!(prompt.format, ChatFormat::Jinja);
    }

    #[test]
    fn schema_with_tools_is_rejected() {
        let options = ChatOptions::default()
            .with_tools(vec![Tool::function("f", "", json!({"type": "object"}))])
            .with_json_schema(json!({"type": "string"}));
        let err = JinjaTemplate::new(None)
            .unwrap()
            .render(&[ChatMessage::user("x")], &options)
            .unwrap_err();
        assert!(matches!(err, ChatError::Tools(_)));
    }
}
