//! Provider clients: how each assistant CLI is launched.
//!
//! A [`HeadlessClient`] knows one provider's executable, flags and env
//! contract; the [`ClientRegistry`] is an explicit value built at startup
//! and threaded through to whoever spawns workers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::parser::{
    AmpParser,
    BaseParser,
    ClaudeParser,
    CodexParser,
    DEFAULT_CONTEXT_WINDOW,
    GeminiParser,
    OpencodeParser,
};
use super::process::{HeadlessProcess, InitHook, ProcessError};
use super::spawn::SpawnBuilder;
use crate::util::paths::resolve_executable;

/// Environment variable naming the beads database directory.
pub const BEADS_DIR_ENV: &str = "BEADS_DIR";
/// Environment variable carrying per-process MCP configuration so each
/// subprocess sees only its assigned MCP server.
pub const OPENCODE_CONFIG_ENV: &str = "OPENCODE_CONFIG_CONTENT";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Claude,
    Amp,
    Codex,
    Gemini,
    Opencode,
}

impl ProviderKind {
    pub fn all() -> [ProviderKind; 5] {
        [
            ProviderKind::Claude,
            ProviderKind::Amp,
            ProviderKind::Codex,
            ProviderKind::Gemini,
            ProviderKind::Opencode,
        ]
    }

    pub fn executable_name(self) -> &'static str {
        match self {
            ProviderKind::Claude => "claude",
            ProviderKind::Amp => "amp",
            ProviderKind::Codex => "codex",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Opencode => "opencode",
        }
    }
}

/// Typed per-provider launch options. The serde representation keeps the
/// flat `<provider>.<key>` keys stable for configs written by hand.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderExtensions {
    Claude {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        env: Option<HashMap<String, String>>,
    },
    Amp {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        mode: Option<String>,
    },
    Codex {
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        sandbox: Option<String>,
    },
    Gemini {
        #[serde(default)]
        model: Option<String>,
    },
    Opencode {
        #[serde(default)]
        model: Option<String>,
    },
}

impl ProviderExtensions {
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Claude => ProviderExtensions::Claude { model: None, env: None },
            ProviderKind::Amp => ProviderExtensions::Amp { model: None, mode: None },
            ProviderKind::Codex => ProviderExtensions::Codex {
                model: None,
                sandbox: None,
            },
            ProviderKind::Gemini => ProviderExtensions::Gemini { model: None },
            ProviderKind::Opencode => ProviderExtensions::Opencode { model: None },
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderExtensions::Claude { .. } => ProviderKind::Claude,
            ProviderExtensions::Amp { .. } => ProviderKind::Amp,
            ProviderExtensions::Codex { .. } => ProviderKind::Codex,
            ProviderExtensions::Gemini { .. } => ProviderKind::Gemini,
            ProviderExtensions::Opencode { .. } => ProviderKind::Opencode,
        }
    }

    pub fn model(&self) -> Option<&str> {
        match self {
            ProviderExtensions::Claude { model, .. }
            | ProviderExtensions::Amp { model, .. }
            | ProviderExtensions::Codex { model, .. }
            | ProviderExtensions::Gemini { model }
            | ProviderExtensions::Opencode { model } => model.as_deref(),
        }
    }
}

/// Everything a client needs to launch one assistant turn.
#[derive(Clone)]
pub struct SpawnConfig {
    pub working_dir: PathBuf,
    pub prompt: String,
    /// Resume this provider session instead of starting fresh.
    pub session_ref: Option<String>,
    pub beads_dir: Option<PathBuf>,
    /// Per-process MCP configuration, injected via env for providers that
    /// take it that way.
    pub mcp_config: Option<serde_json::Value>,
    pub timeout: Option<Duration>,
    pub extensions: ProviderExtensions,
    /// Forward-compat bag for extension keys no variant models yet.
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub capture_stderr: bool,
    /// Context-window override for the model family in use.
    pub context_window: Option<u64>,
    pub on_init: Option<InitHook>,
}

impl SpawnConfig {
    pub fn new(working_dir: impl Into<PathBuf>, prompt: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            working_dir: working_dir.into(),
            prompt: prompt.into(),
            session_ref: None,
            beads_dir: None,
            mcp_config: None,
            timeout: None,
            extensions: ProviderExtensions::for_kind(kind),
            extra: serde_json::Map::new(),
            capture_stderr: true,
            context_window: None,
            on_init: None,
        }
    }
}

#[async_trait]
pub trait HeadlessClient: Send + Sync {
    fn kind(&self) -> ProviderKind;
    async fn spawn(&self, config: &SpawnConfig) -> Result<Arc<dyn HeadlessProcess>, ProcessError>;
}

fn base_builder(
    provider: &'static str,
    config: &SpawnConfig,
) -> Result<SpawnBuilder, ProcessError> {
    let executable = resolve_executable(provider)
        .ok_or_else(|| ProcessError::ExecutableNotFound(provider.to_string()))?;
    let mut builder = SpawnBuilder::new(provider)
        .executable(executable)
        .working_dir(&config.working_dir)
        .capture_stderr(config.capture_stderr);
    if let Some(beads_dir) = &config.beads_dir {
        builder = builder.env(BEADS_DIR_ENV, beads_dir.display().to_string());
    }
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(hook) = &config.on_init {
        builder = builder.on_init(hook.clone());
    }
    Ok(builder)
}

pub struct ClaudeClient;

#[async_trait]
impl HeadlessClient for ClaudeClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Claude
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<Arc<dyn HeadlessProcess>, ProcessError> {
        let window = config.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let mut builder = base_builder("claude", config)?
            .parser(Arc::new(ClaudeParser::new(BaseParser::new(window))))
            .args(["-p", config.prompt.as_str(), "--output-format", "stream-json", "--verbose"]);
        if let Some(session) = &config.session_ref {
            builder = builder.args(["--resume", session.as_str()]);
        }
        if let ProviderExtensions::Claude { model, env } = &config.extensions {
            if let Some(model) = model {
                builder = builder.args(["--model", model.as_str()]);
            }
            if let Some(env) = env {
                for (key, value) in env {
                    builder = builder.env(key, value);
                }
            }
        }
        Ok(builder.spawn()?)
    }
}

pub struct AmpClient;

#[async_trait]
impl HeadlessClient for AmpClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Amp
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<Arc<dyn HeadlessProcess>, ProcessError> {
        let window = config.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let mut builder = base_builder("amp", config)?
            .parser(Arc::new(AmpParser::new(BaseParser::new(window))))
            .args(["--execute", config.prompt.as_str(), "--stream-json"]);
        if let Some(session) = &config.session_ref {
            builder = builder.args(["--thread", session.as_str()]);
        }
        if let ProviderExtensions::Amp { model, mode } = &config.extensions {
            if let Some(model) = model {
                builder = builder.args(["--model", model.as_str()]);
            }
            if let Some(mode) = mode {
                builder = builder.args(["--mode", mode.as_str()]);
            }
        }
        Ok(builder.spawn()?)
    }
}

pub struct CodexClient;

#[async_trait]
impl HeadlessClient for CodexClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Codex
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<Arc<dyn HeadlessProcess>, ProcessError> {
        let window = config.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let mut builder = base_builder("codex", config)?
            .parser(Arc::new(CodexParser::new(BaseParser::new(window))))
            .args(["exec", "--json"]);
        if let Some(session) = &config.session_ref {
            builder = builder.args(["resume", session.as_str()]);
        }
        if let ProviderExtensions::Codex { model, sandbox } = &config.extensions {
            if let Some(model) = model {
                builder = builder.args(["-m", model.as_str()]);
            }
            if let Some(sandbox) = sandbox {
                builder = builder.args(["--sandbox", sandbox.as_str()]);
            }
        }
        // Codex reads the task from stdin rather than argv.
        builder = builder.stdin_prompt(config.prompt.clone());
        Ok(builder.spawn()?)
    }
}

pub struct GeminiClient;

#[async_trait]
impl HeadlessClient for GeminiClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<Arc<dyn HeadlessProcess>, ProcessError> {
        let mut builder = match config.context_window {
            Some(window) => base_builder("gemini", config)?
                .parser(Arc::new(GeminiParser::new(BaseParser::new(window)))),
            None => base_builder("gemini", config)?.parser(Arc::new(GeminiParser::default())),
        };
        builder = builder.args(["--output-format", "stream-json", "--prompt", config.prompt.as_str()]);
        if let Some(session) = &config.session_ref {
            builder = builder.args(["--resume", session.as_str()]);
        }
        if let ProviderExtensions::Gemini { model } = &config.extensions {
            if let Some(model) = model {
                builder = builder.args(["-m", model.as_str()]);
            }
        }
        Ok(builder.spawn()?)
    }
}

pub struct OpencodeClient;

#[async_trait]
impl HeadlessClient for OpencodeClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Opencode
    }

    async fn spawn(&self, config: &SpawnConfig) -> Result<Arc<dyn HeadlessProcess>, ProcessError> {
        let window = config.context_window.unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let mut builder = base_builder("opencode", config)?
            .parser(Arc::new(OpencodeParser::new(BaseParser::new(window))))
            .args(["run", "--format", "json", config.prompt.as_str()]);
        if let Some(session) = &config.session_ref {
            builder = builder.args(["-s", session.as_str()]);
        }
        if let ProviderExtensions::Opencode { model } = &config.extensions {
            if let Some(model) = model {
                builder = builder.args(["-m", model.as_str()]);
            }
        }
        if let Some(mcp_config) = &config.mcp_config {
            let content =
                serde_json::to_string(mcp_config).unwrap_or_else(|_| "{}".to_string());
            builder = builder.env(OPENCODE_CONFIG_ENV, content);
        }
        Ok(builder.spawn()?)
    }
}

/// Explicit provider registry, constructed once at startup.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ProviderKind, Arc<dyn HeadlessClient>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All five built-in providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeClient));
        registry.register(Arc::new(AmpClient));
        registry.register(Arc::new(CodexClient));
        registry.register(Arc::new(GeminiClient));
        registry.register(Arc::new(OpencodeClient));
        registry
    }

    pub fn register(&mut self, client: Arc<dyn HeadlessClient>) {
        self.clients.insert(client.kind(), client);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn HeadlessClient>> {
        self.clients.get(&kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_with_defaults_covers_all_providers() {
        let registry = ClientRegistry::with_defaults();
        for kind in ProviderKind::all() {
            assert!(registry.get(kind).is_some(), "missing client for {kind}");
        }
    }

    #[test]
    fn test_provider_kind_round_trips_through_strings() {
        use std::str::FromStr;
        for kind in ProviderKind::all() {
            assert_eq!(ProviderKind::from_str(&kind.to_string()).unwrap(), kind);
        }
    }

    #[test]
    fn test_extensions_default_per_kind() {
        for kind in ProviderKind::all() {
            let extensions = ProviderExtensions::for_kind(kind);
            assert_eq!(extensions.kind(), kind);
            assert!(extensions.model().is_none());
        }
    }

    #[test]
    fn test_extensions_serde_shape() {
        let extensions = ProviderExtensions::Codex {
            model: Some("o4".to_string()),
            sandbox: Some("workspace-write".to_string()),
        };
        let value = serde_json::to_value(&extensions).unwrap();
        assert_eq!(value["provider"], "codex");
        assert_eq!(value["sandbox"], "workspace-write");
    }
}
