//! Chat formatting against the loaded model.
//!
//! The template source is picked in order: explicit argument, the
//! `chat_template` parameter, the template embedded in the model. The
//! model's BOS/EOS text is filled in when the caller leaves it empty.

use tracing::info_span;

use cactus_chat::{
    parse_messages, resolve_formatter, validate_template, BuiltinTemplate, ChatFormatter,
    ChatMessage, ChatOptions, ChatPrompt, TemplateKind,
};
use cactus_engine::TokenId;
use cactus_sampling::SamplingConfig;

use crate::completion::CompletionOutput;
use crate::context::Context;
use crate::error::Result;

impl Context {
    fn template_source<'a>(&'a self, template: Option<&'a str>) -> Option<&'a str> {
        template
            .or(self.params.chat_template.as_deref())
            .or(self.engine.metadata().chat_template.as_deref())
    }

    /// Text of a special token; empty when the model has none.
    fn special_text(&self, token: Option<TokenId>) -> Result<String> {
        let Some(token) = token else {
            return Ok(String::new());
        };
        let piece = self.engine.vocab().token_to_piece(token, true)?;
        Ok(String::from_utf8_lossy(&piece).into_owned())
    }

    fn with_model_tokens(&self, options: &ChatOptions) -> Result<ChatOptions> {
        let mut options = options.clone();
        if options.bos_token.is_empty() {
            options.bos_token = self.special_text(self.engine.vocab().bos())?;
        }
        if options.eos_token.is_empty() {
            options.eos_token = self.special_text(Some(self.engine.vocab().eos()))?;
        }
        Ok(options)
    }

    /// Render messages with the configured strategy and template.
    pub fn format_chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatPrompt> {
        self.format_chat_with(self.params.template_kind, None, messages, options)
    }

    /// Render messages with an explicit strategy and optional template override.
    pub fn format_chat_with(
        &self,
        kind: TemplateKind,
        template: Option<&str>,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatPrompt> {
        let formatter = resolve_formatter(kind, self.template_source(template))?;
        let options = self.with_model_tokens(options)?;
        Ok(formatter.render(messages, &options)?)
    }

    /// Render a JSON message array with the built-in families.
    pub fn get_formatted_chat(&self, messages_json: &str, template: Option<&str>) -> Result<String> {
        let messages = parse_messages(messages_json)?;
        let formatter = BuiltinTemplate::resolve(self.template_source(template))?;
        let options = self.with_model_tokens(&ChatOptions::default())?;
        Ok(formatter.render(&messages, &options)?.prompt)
    }

    /// Whether a template (or the model's own) is usable with a strategy.
    pub fn validate_chat_template(&self, use_jinja: bool, template: Option<&str>) -> bool {
        let kind = if use_jinja {
            TemplateKind::Jinja
        } else {
            TemplateKind::Builtin
        };
        validate_template(kind, self.template_source(template))
    }

    /// Format, then complete with the grammar and stop strings the template
    /// asks for. An explicit grammar in `sampling` wins over the template's.
    pub fn chat(
        &mut self,
        messages: &[ChatMessage],
        options: &ChatOptions,
        mut sampling: SamplingConfig,
    ) -> Result<CompletionOutput> {
        let span = info_span!("chat", id = %self.id);
        let _enter = span.enter();

        let prompt = self.format_chat(messages, options)?;
        if sampling.grammar.is_none() && sampling.json_schema.is_none() {
            sampling.grammar = prompt.grammar;
        }
        for stop in prompt.additional_stops {
            if !sampling.stop.contains(&stop) {
                sampling.stop.push(stop);
            }
        }
        tracing::debug!(format = ?prompt.format, n_stops = sampling.stop.len(), "chat formatted");
        self.complete(&prompt.prompt, sampling)
    }
}
