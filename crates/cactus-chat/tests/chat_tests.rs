//! Integration tests for cactus-chat.
//!
//! Validates:
//! - Strategy resolution (built-in families, Jinja, fallbacks)
//! - Message content reaches the prompt in order
//! - Schema and tool grammars constrain real decoding
//! - Malformed schemas, tools and templates fail before generation

use cactus_chat::*;
use cactus_sampling::{Grammar, GrammarMatcher, Sampler, SamplingConfig};
use cactus_tokenizer::{ByteVocab, Vocabulary};
use serde_json::json;

fn conversation() -> Vec<ChatMessage> {
    vec![
        ChatMessage::system("You are terse."),
        ChatMessage::user("What is 2+2?"),
        ChatMessage::assistant("4"),
        ChatMessage::user("And 3+3?"),
    ]
}

fn assert_in_order(prompt: &str, messages: &[ChatMessage]) {
    let mut from = 0;
    for msg in messages {
        let at = prompt[from..]
            .find(&msg.content)
            .unwrap_or_else(|| panic!("missing {:?} in {:?}", msg.content, prompt));
        from += at + msg.content.len();
    }
}

// ===========================================================================
// Strategy Resolution
// ===========================================================================

#[test]
fn builtin_resolves_embedded_template_by_markers() {
    let embedded = "{% for m in messages %}<|im_start|>{{ m.role }}\n{{ m.content }}<|im_end|>{% endfor %}";
    let formatter = resolve_formatter(TemplateKind::Builtin, Some(embedded)).unwrap();
    let prompt = formatter.render(&conversation(), &ChatOptions::default()).unwrap();
    assert_eq!(prompt.format, ChatFormat::Builtin(BuiltinTemplate::ChatMl));
    assert!(prompt.prompt.ends_with("<|im_start|>assistant\n"));
    assert_eq!(prompt.additional_stops, vec!["<|im_end|>".to_string()]);
}

#[test]
fn builtin_without_template_uses_generic() {
    let formatter = resolve_formatter(TemplateKind::Builtin, None).unwrap();
    let prompt = formatter.render(&conversation(), &ChatOptions::default()).unwrap();
    assert_eq!(prompt.format, ChatFormat::Builtin(BuiltinTemplate::Generic));
    assert!(prompt.prompt.starts_with("system: You are terse."));
}

#[test]
fn unknown_template_is_not_silently_replaced() {
    assert!(!validate_template(TemplateKind::Builtin, Some("{{ custom }}")));
    assert!(matches!(
        resolve_formatter(TemplateKind::Builtin, Some("{{ custom }}")).err(),
        Some(ChatError::UnsupportedTemplate(_))
    ));
    // The template engine can still render it.
    assert!(validate_template(TemplateKind::Jinja, Some("{{ custom }}")));
}

#[test]
fn jinja_rejects_broken_syntax() {
    assert!(!validate_template(TemplateKind::Jinja, Some("{% if %}")));
}

#[test]
fn every_strategy_preserves_message_order() {
    let messages = conversation();
    for family in BuiltinTemplate::ALL {
        let prompt = family.render(&messages, &ChatOptions::default()).unwrap();
        assert_in_order(&prompt.prompt, &messages);
    }
    let jinja = JinjaTemplate::new(None).unwrap();
    let prompt = jinja.render(&messages, &ChatOptions::default()).unwrap();
    assert_in_order(&prompt.prompt, &messages);
}

#[test]
fn parsed_messages_render_like_constructed_ones() {
    let parsed = parse_messages(
        r#"[{"role":"user","content":[{"type":"text","text":"What is "},{"type":"text","text":"2+2?"}]}]"#,
    )
    .unwrap();
    let a = BuiltinTemplate::Llama3.apply(&parsed, true);
    let b = BuiltinTemplate::Llama3.apply(&[ChatMessage::user("What is 2+2?")], true);
    assert_eq!(a, b);
}

// ===========================================================================
// Structured Output
// ===========================================================================

#[test]
fn schema_grammar_drives_decoding() {
    let schema = json!({
        "type": "object",
        "properties": {"ok": {"type": "boolean"}},
        "required": ["ok"]
    });
    let options = ChatOptions::default().with_json_schema(schema);
    let prompt = BuiltinTemplate::ChatMl
        .render(&[ChatMessage::user("ok?")], &options)
        .unwrap();
    let grammar = prompt.grammar.expect("schema grammar");

    // The model would rather say 't' forever; the grammar forces valid JSON.
    let vocab = ByteVocab::new();
    let mut logits = vec![0.0f32; ByteVocab::N_VOCAB];
    logits[b't' as usize] = 5.0;
    logits[b'}' as usize] = 4.0;
    logits[ByteVocab::EOS as usize] = 3.0;
    // Rank punctuation above optional whitespace.
    logits[b'"' as usize] = 2.0;
    logits[b':' as usize] = 2.0;
    let mut sampler = Sampler::new(SamplingConfig::greedy().with_grammar(grammar)).unwrap();
    let mut out = Vec::new();
    for _ in 0..64 {
        let token = sampler.sample(&logits, &vocab).unwrap().token;
        if vocab.is_eog(token) {
            break;
        }
        sampler.accept(token, &vocab).unwrap();
        out.push(token);
    }
    let text = vocab.detokenize(&out).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value, json!({"ok": true}));
}

#[test]
fn malformed_schema_fails_before_generation() {
    let options = ChatOptions::default().with_json_schema(json!({"type": "tuple"}));
    assert!(BuiltinTemplate::ChatMl
        .render(&[ChatMessage::user("x")], &options)
        .is_err());
    assert!(JinjaTemplate::new(None)
        .unwrap()
        .render(&[ChatMessage::user("x")], &options)
        .is_err());
}

// ===========================================================================
// Tools
// ===========================================================================

fn calculator() -> Vec<Tool> {
    parse_tools(
        r#"[{"type":"function","function":{"name":"add","description":"Add two integers",
            "parameters":{"type":"object","properties":{"a":{"type":"integer"},"b":{"type":"integer"}},"required":["a","b"]}}}]"#,
    )
    .unwrap()
}

fn matches(grammar: &str, text: &str) -> bool {
    let mut m = GrammarMatcher::new(Grammar::parse(grammar).unwrap());
    m.accept_str(text) && m.is_accepting()
}

#[test]
fn required_tool_choice_constrains_reply() {
    let options = ChatOptions::default()
        .with_tools(calculator())
        .with_tool_choice("required".parse().unwrap());
    let prompt = JinjaTemplate::new(None)
        .unwrap()
        .render(&conversation(), &options)
        .unwrap();
    let grammar = prompt.grammar.unwrap();
    assert!(matches(&grammar, r#"{"name": "add", "arguments": {"a": 3, "b": 3}}"#));
    assert!(!matches(&grammar, "6"));
}

#[test]
fn auto_tool_choice_allows_prose() {
    let options = ChatOptions::default().with_tools(calculator());
    let prompt = JinjaTemplate::new(None)
        .unwrap()
        .render(&conversation(), &options)
        .unwrap();
    let grammar = prompt.grammar.unwrap();
    assert!(matches(&grammar, "Six."));
    assert!(matches(&grammar, r#"{"name":"add","arguments":{"a":3,"b":3}}"#));
}

#[test]
fn none_tool_choice_hides_tools() {
    let options = ChatOptions::default()
        .with_tools(calculator())
        .with_tool_choice(ToolChoice::None);
    let prompt = JinjaTemplate::new(None)
        .unwrap()
        .render(&conversation(), &options)
        .unwrap();
    assert!(prompt.grammar.is_none());
    assert!(!prompt.prompt.contains("Add two integers"));
}

#[test]
fn builtin_tools_constrain_reply() {
    let options = ChatOptions::default()
        .with_tools(calculator())
        .with_tool_choice(ToolChoice::Required);
    let prompt = BuiltinTemplate::ChatMl.render(&conversation(), &options).unwrap();
    assert!(!prompt.prompt.contains("Add two integers"));
    let grammar = prompt.grammar.unwrap();
    assert!(matches(&grammar, r#"{"name": "add", "arguments": {"a": 1, "b": 2}}"#));
    assert!(!matches(&grammar, "3"));
}

#[test]
fn builtin_rejects_malformed_tools() {
    let mut retrieval = Tool::function("lookup", "Search", json!({"type": "object"}));
    retrieval.kind = "retrieval".to_string();
    let unnamed = Tool::function("", "Nothing", json!({"type": "object"}));
    let scalar_params = Tool::function("add", "Add", json!("integers"));

    for tool in [retrieval, unnamed, scalar_params] {
        for choice in [ToolChoice::Required, ToolChoice::None] {
            let options = ChatOptions::default()
                .with_tools(vec![tool.clone()])
                .with_tool_choice(choice);
            let err = BuiltinTemplate::ChatMl
                .render(&conversation(), &options)
                .unwrap_err();
            assert!(matches!(err, ChatError::Tools(_)), "{:?}", err);
        }
    }
}
