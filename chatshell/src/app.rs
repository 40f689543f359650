use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use directories::BaseDirs;
use dotenvy::dotenv;
use serde::Serialize;
use serde_yml::ser::Serializer;
use tracing::{info, warn};

use crate::dispatch::Dispatcher;
use crate::factory::{ClientFactory, SUPPORTED_PROVIDERS};
use crate::provider::{param, Client, ModelConfig, TracingTransport};
use crate::session::{ChatSession, Role, SessionManager, SessionStore};

// In general, use `App::args()` to fetch args.
// Set this directly if you really want to override initialization.
pub static ARGS: OnceLock<Arguments> = OnceLock::new();

#[derive(Parser, Debug, Clone, Default)]
#[clap(name = "chatshell", version, about = "Chat with LLM providers from the shell")]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Provider to talk to
    #[clap(short, long, global = true, env = "CHATSHELL_PROVIDER", default_value = "openai")]
    pub provider: String,

    /// The name of the LLM to use
    #[clap(short, long, global = true, env = "DEFAULT_MODEL")]
    pub model: Option<String>,

    #[clap(long, global = true)]
    pub temperature: Option<f64>,

    #[clap(long, global = true)]
    pub max_tokens: Option<i64>,

    #[clap(long, global = true)]
    pub top_p: Option<f64>,

    #[clap(long, global = true)]
    pub top_k: Option<i64>,

    #[clap(long, global = true)]
    pub frequency_penalty: Option<f64>,

    #[clap(long, global = true)]
    pub presence_penalty: Option<f64>,

    /// low, medium or high (reasoning models)
    #[clap(long, global = true)]
    pub reasoning_effort: Option<String>,

    /// Token budget for extended thinking
    #[clap(long, global = true)]
    pub thinking_budget: Option<i64>,

    /// Override the provider's API endpoint
    #[clap(long, global = true)]
    pub base_url: Option<String>,

    /// Log request and response bodies at debug level
    #[clap(long, global = true)]
    pub debug_http: bool,

    /// User input; read from stdin when absent
    #[clap(short, long, global = true)]
    pub text: Option<String>,

    /// Session name, id or unique name prefix
    #[clap(short = 'S', long, global = true)]
    pub session: Option<String>,

    /// Where the session registry is kept
    #[clap(long, global = true, env = "CHATSHELL_STATE", hide_env_values = true)]
    pub state: Option<String>,
}

#[derive(Subcommand, Default, Debug, Clone)]
pub enum Command {
    /// List supported providers
    ListProviders,

    #[default]
    /// List sessions, marking the active one
    ListSessions,

    /// Create a session and make it active
    New {
        name: Option<String>,

        #[clap(long)]
        system: Option<String>,

        #[clap(long)]
        message: Option<String>,
    },

    /// Make a session active
    Use { session: String },

    /// Dump a session as YAML
    Show { session: String },

    Delete { session: String },

    /// Duplicate a session's prompt and history
    Copy { source: String, target: Option<String> },

    /// Write a session to a JSON file
    Export { session: String, path: String },

    /// Load a session from a JSON file
    Import { path: String },

    /// Send a message and wait for the reply
    Send,

    /// See results in realtime
    Stream,

    /// Show the model's thinking before its answer
    Think,
}

impl Command {
    fn mutates(&self) -> bool {
        !matches!(self, Command::ListProviders | Command::ListSessions | Command::Show { .. } | Command::Export { .. })
    }
}

pub struct App {
    pub dispatcher: Dispatcher,
}

impl Default for App {
    fn default() -> Self {
        Self::empty().with_dispatcher(Dispatcher::default())
    }
}

impl App {
    pub fn args() -> &'static Arguments {
        ARGS.get_or_init(|| {
            let env_file = BaseDirs::new()
                .map(|p| p.config_dir().join("chatshell/.env"))
                .filter(|p| p.is_file());

            if let Some(path) = env_file {
                // Possibly before configuring tracing subscribers
                dotenvy::from_path(path).ok();
            }

            if cfg!(debug_assertions) {
                dotenv().ok();
            }

            Arguments::parse()
        })
    }

    pub fn empty() -> Self {
        Self {
            dispatcher: Dispatcher::empty(),
        }
    }

    pub fn with_dispatcher(self, dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    /// App whose factory honours `--base-url`.
    pub fn from_args(args: &Arguments) -> Self {
        let mut factory = ClientFactory::new();
        if let Some(url) = &args.base_url {
            factory = factory.with_base_url(&args.provider, url);
        }
        Self::empty().with_dispatcher(Dispatcher::with_factory(Arc::new(factory)))
    }

    fn get_model_client(&self, args: &Arguments) -> Result<Arc<dyn Client>> {
        let client = self
            .dispatcher
            .client_for(&args.provider)
            .with_context(|| format!("No client for provider {}", args.provider))?;

        if args.debug_http {
            client.set_debug_transport(Some(Arc::new(TracingTransport)));
        }
        Ok(client)
    }

    fn get_user_text(&self, args: &Arguments) -> Result<String> {
        let text = match &args.text {
            Some(text) => text.clone(),
            None => {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            }
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(anyhow!("No input text, pass --text or pipe it on stdin"));
        }
        Ok(text)
    }

    /// Loads the registry, runs the command and saves the registry back if
    /// the command may have changed it, even when the command failed.
    pub async fn run<W: Write>(&self, args: &Arguments, out: &mut W) -> Result<()> {
        let state = state_path(args)?;
        let store = SessionStore::load(&state).with_context(|| format!("Failed to load sessions from {state:?}"))?;
        let mut manager = SessionManager::new(store);

        let command = args.command.clone().unwrap_or_default();
        let result = self.execute(&command, args, &mut manager, out).await;

        if command.mutates() {
            manager
                .store()
                .save(&state)
                .with_context(|| format!("Failed to save sessions to {state:?}"))?;
        }
        result
    }

    async fn execute<W: Write>(
        &self,
        command: &Command,
        args: &Arguments,
        manager: &mut SessionManager,
        out: &mut W,
    ) -> Result<()> {
        match command {
            Command::ListProviders => {
                for name in SUPPORTED_PROVIDERS {
                    writeln!(out, "{}", name)?;
                }
            }
            Command::ListSessions => {
                for session in manager.list_sessions() {
                    let marker = if session.is_active { "*" } else { " " };
                    writeln!(out, "{marker} {} ({} messages)", session.name, session.messages.len())?;
                }
            }
            Command::New { name, system, message } => {
                let name = match name {
                    Some(name) => name.clone(),
                    None => manager.generate_default_name(),
                };
                let created = manager.create_session(
                    &name,
                    system.as_deref().unwrap_or_default(),
                    message.as_deref().unwrap_or_default(),
                )?;

                if let Some(warning) = &created.warning {
                    eprintln!("{warning}");
                }
                writeln!(out, "{}", created.session.name)?;
            }
            Command::Use { session } => {
                let id = manager.find_by_prefix(session)?.id.clone();
                let active = manager.set_active(&id)?;
                writeln!(out, "{}", active.name)?;
            }
            Command::Show { session } => {
                let session = manager.find_by_prefix(session)?;
                let mut ser = Serializer::new(&mut *out);
                session.serialize(&mut ser)?;
            }
            Command::Delete { session } => {
                let id = manager.find_by_prefix(session)?.id.clone();
                let removed = manager.delete_session(&id)?;
                writeln!(out, "Deleted {}", removed.name)?;
            }
            Command::Copy { source, target } => {
                let created = manager.copy_session(source, target.as_deref())?;
                if let Some(warning) = &created.warning {
                    eprintln!("{warning}");
                }
                writeln!(out, "{}", created.session.name)?;
            }
            Command::Export { session, path } => {
                let id = manager.find_by_prefix(session)?.id.clone();
                let path = expand(path)?;
                manager.export_to_json(&id, &path)?;
                info!(path = ?path, "Exported session");
            }
            Command::Import { path } => {
                let imported = manager.import_from_json(expand(path)?)?;
                writeln!(out, "{}", imported.name)?;
            }
            Command::Send | Command::Stream | Command::Think => {
                let client = self.get_model_client(args)?;
                let text = self.get_user_text(args)?;
                let id = chat_target(manager, args)?;
                manager.add_message(&id, Role::User, &text)?;

                let session = manager.get_by_id(&id)?.clone();
                let config = model_config(args);

                let reply = match command {
                    Command::Send => self.send(client.as_ref(), &session, &config, out).await?,
                    Command::Stream => self.stream(client.as_ref(), &session, &config, out).await?,
                    _ => self.think(client.as_ref(), &session, &config, out).await?,
                };
                manager.add_message(&id, Role::Assistant, &reply)?;
            }
        }

        Ok(())
    }

    async fn send<W: Write>(
        &self,
        client: &dyn Client,
        session: &ChatSession,
        config: &ModelConfig,
        out: &mut W,
    ) -> Result<String> {
        let reply = self.dispatcher.send_chat_completion(Some(client), session, config).await?;
        writeln!(out, "{reply}")?;
        Ok(reply)
    }

    async fn stream<W: Write>(
        &self,
        client: &dyn Client,
        session: &ChatSession,
        config: &ModelConfig,
        out: &mut W,
    ) -> Result<String> {
        let mut stream = self.dispatcher.stream_chat_completion(Some(client), session, config).await?;
        let mut reply = String::new();

        while let Some(chunk) = stream.next().await {
            write!(out, "{}", chunk.content)?;
            out.flush()?;
            reply.push_str(&chunk.content);

            if let Some(err) = chunk.error {
                writeln!(out)?;
                return Err(err.into());
            }
        }

        writeln!(out)?;
        Ok(reply)
    }

    async fn think<W: Write>(
        &self,
        client: &dyn Client,
        session: &ChatSession,
        config: &ModelConfig,
        out: &mut W,
    ) -> Result<String> {
        let response = self.dispatcher.send_structured_completion(Some(client), session, config).await;

        for block in &response.thinking_blocks {
            writeln!(out, "[{}] {}", serde_json::to_value(block.kind)?.as_str().unwrap_or("thinking"), block.content)?;
        }
        if !response.text_content.is_empty() {
            writeln!(out, "{}", response.text_content)?;
        }

        match response.error {
            Some(error) => {
                warn!(code = %error.code, "Structured completion failed");
                Err(anyhow!("{error}"))
            }
            None => Ok(response.text_content),
        }
    }
}

/// `--session`, else the active session, else a new default-named one.
fn chat_target(manager: &mut SessionManager, args: &Arguments) -> Result<String> {
    if let Some(identifier) = &args.session {
        return Ok(manager.find_by_prefix(identifier)?.id.clone());
    }
    if let Some(active) = manager.active() {
        return Ok(active.id.clone());
    }

    let name = manager.generate_default_name();
    Ok(manager.create_session(&name, "", "")?.session.id)
}

pub fn default_model(provider: &str) -> &'static str {
    match provider {
        "openai-reasoning" => "o3-mini",
        "anthropic" => "claude-sonnet-4-20250514",
        "gemini" => "gemini-2.5-flash",
        "openrouter" => "openai/gpt-4o-mini",
        "moonshot" => "moonshot-v1-8k",
        "mock" => "mock-1",
        _ => "gpt-4o-mini",
    }
}

pub fn model_config(args: &Arguments) -> ModelConfig {
    let provider = args.provider.to_ascii_lowercase();
    let model = args.model.clone().unwrap_or_else(|| default_model(&provider).to_string());
    let mut config = ModelConfig::new(provider, model);

    let floats = [
        (param::TEMPERATURE, args.temperature),
        (param::TOP_P, args.top_p),
        (param::FREQUENCY_PENALTY, args.frequency_penalty),
        (param::PRESENCE_PENALTY, args.presence_penalty),
    ];
    for (key, value) in floats {
        if let Some(v) = value {
            config = config.with_param(key, v);
        }
    }

    let ints = [
        (param::MAX_TOKENS, args.max_tokens),
        (param::TOP_K, args.top_k),
        (param::THINKING_BUDGET, args.thinking_budget),
    ];
    for (key, value) in ints {
        if let Some(v) = value {
            config = config.with_param(key, v);
        }
    }

    if let Some(effort) = &args.reasoning_effort {
        config = config.with_param(param::REASONING_EFFORT, effort.as_str());
    }
    config
}

fn expand(path: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(shellexpand::full(path)?.into_owned()))
}

fn state_path(args: &Arguments) -> Result<PathBuf> {
    match &args.state {
        Some(path) => expand(path),
        None => BaseDirs::new()
            .map(|p| p.config_dir().join("chatshell/sessions.yml"))
            .ok_or_else(|| anyhow!("Cannot locate a config directory, set CHATSHELL_STATE")),
    }
}
