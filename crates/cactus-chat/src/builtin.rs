//! Built-in template families.
//!
//! A model's embedded template is matched to a known family by its marker
//! tokens (or by family name). A model without a template falls back to the
//! generic `role: content` layout; a template that matches no family is an
//! error rather than a silent fallback.

use std::fmt;
use std::str::FromStr;

use crate::{
    reply_grammar, ChatError, ChatFormat, ChatFormatter, ChatMessage, ChatOptions, ChatPrompt,
    Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinTemplate {
    ChatMl,
    Llama3,
    Llama2,
    Phi3,
    Zephyr,
    Gemma,
    Generic,
}

impl BuiltinTemplate {
    pub const ALL: [BuiltinTemplate; 7] = [
        Self::ChatMl,
        Self::Llama3,
        Self::Llama2,
        Self::Phi3,
        Self::Zephyr,
        Self::Gemma,
        Self::Generic,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::ChatMl => "chatml",
            Self::Llama3 => "llama3",
            Self::Llama2 => "llama2",
            Self::Phi3 => "phi3",
            Self::Zephyr => "zephyr",
            Self::Gemma => "gemma",
            Self::Generic => "generic",
        }
    }

    /// Match template source text against known family markers.
    pub fn detect(source: &str) -> Option<Self> {
        let has = |marker: &str| source.contains(marker);
        if has("<|im_start|>") {
            Some(Self::ChatMl)
        } else if has("<|start_header_id|>") && has("<|end_header_id|>") {
            Some(Self::Llama3)
        } else if has("<|assistant|>") && has("<|end|>") {
            Some(Self::Phi3)
        } else if has("<|user|>") && has("</s>") {
            Some(Self::Zephyr)
        } else if has("<start_of_turn>") {
            Some(Self::Gemma)
        } else if has("[INST]") {
            Some(Self::Llama2)
        } else {
            None
        }
    }

    /// Family for an override or embedded template. `None` means the model
    /// ships no template.
    pub fn resolve(source: Option<&str>) -> Result<Self> {
        let Some(source) = source else {
            return Ok(Self::Generic);
        };
        source
            .parse::<Self>()
            .ok()
            .or_else(|| Self::detect(source))
            .ok_or_else(|| ChatError::UnsupportedTemplate(excerpt(source)))
    }

    /// End-of-turn strings for this family.
    pub fn stop_sequences(&self) -> &'static [&'static str] {
        match self {
            Self::ChatMl => &["<|im_end|>"],
            Self::Llama3 => &["<|eot_id|>"],
            Self::Llama2 | Self::Zephyr => &["</s>"],
            Self::Phi3 => &["<|end|>"],
            Self::Gemma => &["<end_of_turn>"],
            Self::Generic => &[],
        }
    }

    pub fn apply(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        match self {
            Self::ChatMl => {
                for msg in messages {
                    out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", msg.role, msg.content));
                }
                if add_generation_prompt {
                    out.push_str("<|im_start|>assistant\n");
                }
            }
            Self::Llama3 => {
                out.push_str("<|begin_of_text|>");
                for msg in messages {
                    out.push_str("<|start_header_id|>");
                    out.push_str(&msg.role);
                    out.push_str("<|end_header_id|>\n\n");
                    out.push_str(&msg.content);
                    out.push_str("<|eot_id|>");
                }
                if add_generation_prompt {
                    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            Self::Llama2 => {
                let mut system: Option<&str> = None;
                for msg in messages {
                    match msg.role.as_str() {
                        "system" => system = Some(&msg.content),
                        "user" => {
                            out.push_str("<s>[INST] ");
                            if let Some(sys) = system.take() {
                                out.push_str(&format!("<<SYS>>\n{}\n<</SYS>>\n\n", sys));
                            }
                            out.push_str(&msg.content);
                            out.push_str(" [/INST]");
                        }
                        _ => {
                            out.push(' ');
                            out.push_str(&msg.content);
                            out.push_str("</s>");
                        }
                    }
                }
            }
            Self::Phi3 => {
                for msg in messages {
                    out.push_str(&format!("<|{}|>\n{}<|end|>\n", msg.role, msg.content));
                }
                if add_generation_prompt {
                    out.push_str("<|assistant|>\n");
                }
            }
            Self::Zephyr => {
                for msg in messages {
                    out.push_str(&format!("<|{}|>\n{}</s>\n", msg.role, msg.content));
                }
                if add_generation_prompt {
                    out.push_str("<|assistant|>\n");
                }
            }
            Self::Gemma => {
                // No system turn: the system text leads the first user turn.
                let mut system: Option<&str> = None;
                for msg in messages {
                    let role = match msg.role.as_str() {
                        "system" => {
                            system = Some(&msg.content);
                            continue;
                        }
                        "assistant" => "model",
                        other => other,
                    };
                    out.push_str("<start_of_turn>");
                    out.push_str(role);
                    out.push('\n');
                    if let Some(sys) = system.take() {
                        out.push_str(sys);
                        out.push_str("\n\n");
                    }
                    out.push_str(&msg.content);
                    out.push_str("<end_of_turn>\n");
                }
                if add_generation_prompt {
                    out.push_str("<start_of_turn>model\n");
                }
            }
            Self::Generic => {
                out = messages
                    .iter()
                    .map(|msg| format!("{}: {}", msg.role, msg.content))
                    .collect::<Vec<_>>()
                    .join("\n");
                if add_generation_prompt {
                    out.push_str("\nassistant:");
                }
            }
        }
        out
    }
}

impl FromStr for BuiltinTemplate {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| ChatError::UnsupportedTemplate(excerpt(s)))
    }
}

impl fmt::Display for BuiltinTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl ChatFormatter for BuiltinTemplate {
    /// Tool descriptions are not rendered by the built-in families, but tools
    /// and a JSON schema still constrain the reply through a grammar.
    fn render(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatPrompt> {
        Ok(ChatPrompt {
            prompt: self.apply(messages, options.add_generation_prompt),
            grammar: reply_grammar(options)?,
            additional_stops: self.stop_sequences().iter().map(|s| s.to_string()).collect(),
            format: ChatFormat::Builtin(*self),
        })
    }
}

fn excerpt(source: &str) -> String {
    const MAX: usize = 48;
    match source.char_indices().nth(MAX) {
        Some((end, _)) => format!("{}...", &source[..end]),
        None => source.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convo() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("S"),
            ChatMessage::user("U"),
            ChatMessage::assistant("A"),
            ChatMessage::user("U2"),
        ]
    }

    #[test]
    fn chatml_layout() {
        let out = BuiltinTemplate::ChatMl.apply(&convo()[..2], true);
        assert_eq!(
            out,
            "<|im_start|>system\nS<|im_end|>\n<|im_start|>user\nU<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn llama3_layout() {
        let out = BuiltinTemplate::Llama3.apply(&[ChatMessage::user("hi")], true);
        assert_eq!(
            out,
            "<|begin_of_text|><|start_header_id|>user<|end_header_id|>\n\nhi<|eot_id|>\
             <|start_header_id|>assistant<|end_header_id|>\n\n"
        );
    }

    #[test]
    fn llama2_folds_system_into_first_user() {
        let out = BuiltinTemplate::Llama2.apply(&convo(), true);
        assert_eq!(
            out,
            "<s>[INST] <<SYS>>\nS\n<</SYS>>\n\nU [/INST] A</s><s>[INST] U2 [/INST]"
        );
    }

    #[test]
    fn gemma_renames_assistant() {
        let out = BuiltinTemplate::Gemma.apply(&convo()[..3], false);
        assert_eq!(
            out,
            "<start_of_turn>user\nS\n\nU<end_of_turn>\n<start_of_turn>model\nA<end_of_turn>\n"
        );
    }

    #[test]
    fn generic_layout() {
        let out = BuiltinTemplate::Generic.apply(&convo()[1..3], true);
        assert_eq!(out, "user: U\nassistant: A\nassistant:");
    }

    #[test]
    fn every_family_preserves_content() {
        let messages = vec![
            ChatMessage::system("sys-text-1"),
            ChatMessage::user("user-text-2"),
            ChatMessage::assistant("assistant-text-3"),
            ChatMessage::user("user-text-4"),
        ];
        for family in BuiltinTemplate::ALL {
            let out = family.apply(&messages, true);
            let mut from = 0;
            for msg in &messages {
                let at = out[from..]
                    .find(&msg.content)
                    .unwrap_or_else(|| panic!("{} lost {:?}", family, msg.content));
                from += at + msg.content.len();
            }
        }
    }

    #[test]
    fn detect_families() {
        assert_eq!(
            BuiltinTemplate::detect("{{ '<|im_start|>' + role }}"),
            Some(BuiltinTemplate::ChatMl)
        );
        assert_eq!(
            BuiltinTemplate::detect("<|start_header_id|>x<|end_header_id|>"),
            Some(BuiltinTemplate::Llama3)
        );
        assert_eq!(
            BuiltinTemplate::detect("<|user|>{{c}}<|end|><|assistant|>"),
            Some(BuiltinTemplate::Phi3)
        );
        assert_eq!(
            BuiltinTemplate::detect("<|user|>{{c}}</s>"),
            Some(BuiltinTemplate::Zephyr)
        );
        assert_eq!(BuiltinTemplate::detect("plain"), None);
    }

    #[test]
    fn resolve_missing_falls_back_to_generic() {
        assert_eq!(BuiltinTemplate::resolve(None).unwrap(), BuiltinTemplate::Generic);
        assert_eq!(
            BuiltinTemplate::resolve(Some("gemma")).unwrap(),
            BuiltinTemplate::Gemma
        );
        assert!(matches!(
            BuiltinTemplate::resolve(Some("{{ mystery }}")).unwrap_err(),
            ChatError::UnsupportedTemplate(_)
        ));
    }

    #[test]
    fn render_carries_stops() {
        let prompt = BuiltinTemplate::Phi3
            .render(&[ChatMessage::user("x")], &ChatOptions::default())
            .unwrap();
        assert_eq!(prompt.additional_stops, vec!["<|end|>".to_string()]);
        assert!(prompt.grammar.is_none());
        assert_eq!(prompt.format, ChatFormat::Builtin(BuiltinTemplate::Phi3));
    }
}
