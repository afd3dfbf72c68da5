//! # cactus-cli
//!
//! Command-line front end: completion, chat, embeddings, benchmark, template
//! validation and tokenization against a model file, using the reference
//! engine.
//!
//! Parsing and execution live here so they can be tested without spawning a
//! process; `main.rs` only installs logging and maps errors to an exit code.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use cactus::{
    parse_messages, parse_tools, ChatOptions, Context, ContextParams, EmbdNormalize,
    ReferenceLoader, SamplingConfig, TemplateKind, ToolChoice,
};

/// cactus: on-device LLM inference
#[derive(Debug, Parser)]
#[command(name = "cactus", version)]
pub struct Cli {
    #[command(flatten)]
    pub model: ModelArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Where the context configuration comes from.
#[derive(Debug, Args)]
pub struct ModelArgs {
    /// JSON file with context parameters.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Model file. Overrides `model_path` from the config file.
    #[arg(short, long, global = true)]
    pub model: Option<PathBuf>,

    /// Context window in tokens.
    #[arg(long, global = true)]
    pub n_ctx: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Complete a prompt.
    Complete {
        /// Prompt text.
        #[arg(short, long)]
        prompt: String,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Answer a chat conversation.
    Chat {
        /// JSON file with `[{"role": .., "content": ..}]` messages.
        #[arg(long)]
        messages: PathBuf,

        /// Render with the template engine instead of the built-in families.
        #[arg(long)]
        jinja: bool,

        /// Template override (family name or template source).
        #[arg(long)]
        template: Option<String>,

        /// JSON file with an OpenAI-style tool list.
        #[arg(long)]
        tools: Option<PathBuf>,

        /// auto, required, none or a tool name.
        #[arg(long, default_value = "auto")]
        tool_choice: String,

        /// JSON schema file the reply must follow.
        #[arg(long)]
        json_schema: Option<PathBuf>,

        #[command(flatten)]
        sampling: SamplingArgs,
    },
    /// Print the embedding of a text as JSON.
    Embed {
        #[arg(short, long)]
        text: String,

        /// -1 none, 0 max-abs, 1 taxicab, 2 euclidean, >2 p-norm.
        #[arg(long, default_value_t = 2, allow_hyphen_values = true)]
        normalize: i32,
    },
    /// Measure prompt and generation throughput.
    Bench {
        #[arg(long, default_value_t = 512)]
        pp: usize,
        #[arg(long, default_value_t = 128)]
        tg: usize,
        #[arg(long, default_value_t = 1)]
        pl: usize,
        #[arg(long, default_value_t = 1)]
        nr: usize,
    },
    /// Check whether a chat template is usable.
    Template {
        /// Template override; the model's own template otherwise.
        #[arg(long)]
        template: Option<String>,

        #[arg(long)]
        jinja: bool,
    },
    /// Print the token ids of a text.
    Tokenize {
        #[arg(short, long)]
        text: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct SamplingArgs {
    /// JSON file with sampling settings; flags below override it.
    #[arg(long)]
    pub sampling_config: Option<PathBuf>,

    /// Maximum number of tokens to generate.
    #[arg(short = 'n', long)]
    pub n_predict: Option<usize>,

    /// Sampling temperature (0 = greedy).
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Random seed for reproducible sampling.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Stop string; may be repeated.
    #[arg(long)]
    pub stop: Vec<String>,

    /// GBNF grammar file.
    #[arg(long)]
    pub grammar: Option<PathBuf>,
}

impl SamplingArgs {
    pub fn to_config(&self) -> Result<SamplingConfig> {
        let mut config = match &self.sampling_config {
            Some(path) => serde_json::from_str(&read(path)?)
                .with_context(|| format!("invalid sampling config {}", path.display()))?,
            None => SamplingConfig::default(),
        };
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if self.n_predict.is_some() {
            config.n_predict = self.n_predict;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        config.stop.extend(self.stop.iter().cloned());
        if let Some(path) = &self.grammar {
            config.grammar = Some(read(path)?);
        }
        Ok(config)
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    serde_json::from_str(&read(path)?).with_context(|| format!("{} is not valid JSON", path.display()))
}

/// Merge the config file with command-line overrides.
pub fn context_params(args: &ModelArgs) -> Result<ContextParams> {
    let mut params = match (&args.config, &args.model) {
        (Some(config), _) => ContextParams::from_json_file(config)?,
        (None, Some(model)) => ContextParams::new(model),
        (None, None) => bail!("either --config or --model is required"),
    };
    if let Some(model) = &args.model {
        params.model_path = model.clone();
    }
    if let Some(n_ctx) = args.n_ctx {
        params.n_ctx = n_ctx;
    }
    Ok(params)
}

/// Execute a parsed command, writing results to `out`.
pub fn run(cli: &Cli, out: &mut dyn Write) -> Result<()> {
    let mut params = context_params(&cli.model)?;
    if matches!(cli.command, Command::Embed { .. }) {
        params.embedding = true;
    }
    let mut ctx = Context::load(params, &ReferenceLoader::new())
        .context("failed to load the model")?;
    info!(model = ctx.model_desc(), n_ctx = ctx.n_ctx(), "model ready");

    match &cli.command {
        Command::Complete { prompt, sampling } => {
            let output = ctx.complete(prompt, sampling.to_config()?)?;
            writeln!(out, "{}", output.text)?;
            info!(stop_reason = ?output.stop_reason, timings = ?output.timings, "completion done");
        }
        Command::Chat {
            messages,
            jinja,
            template,
            tools,
            tool_choice,
            json_schema,
            sampling,
        } => {
            let messages = parse_messages(&read(messages)?)?;
            let mut options = ChatOptions::default()
                .with_tool_choice(tool_choice.parse::<ToolChoice>()?);
            if let Some(path) = tools {
                options = options.with_tools(parse_tools(&read(path)?)?);
            }
            if let Some(path) = json_schema {
                options = options.with_json_schema(read_json(path)?);
            }
            let kind = if *jinja {
                TemplateKind::Jinja
            } else {
                TemplateKind::Builtin
            };
            let prompt = ctx.format_chat_with(kind, template.as_deref(), &messages, &options)?;
            let mut config = sampling.to_config()?;
            if config.grammar.is_none() {
                config.grammar = prompt.grammar;
            }
            config.stop.extend(prompt.additional_stops);
            let output = ctx.complete(&prompt.prompt, config)?;
            writeln!(out, "{}", output.text)?;
        }
        Command::Embed { text, normalize } => {
            let values = ctx.embedding_with(text, EmbdNormalize::from_code(*normalize))?;
            writeln!(out, "{}", serde_json::to_string(&values)?)?;
        }
        Command::Bench { pp, tg, pl, nr } => {
            let result = ctx.bench(*pp, *tg, *pl, *nr)?;
            writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
        }
        Command::Template { template, jinja } => {
            let valid = ctx.validate_chat_template(*jinja, template.as_deref());
            writeln!(out, "{}", if valid { "valid" } else { "invalid" })?;
            if !valid {
                bail!("template cannot be used");
            }
        }
        Command::Tokenize { text } => {
            let tokens = ctx.tokenize(text, false)?;
            writeln!(out, "{}", serde_json::to_string(&tokens)?)?;
        }
    }
    Ok(())
}
