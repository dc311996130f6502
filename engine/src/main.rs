use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::info;
use uuid::Uuid;

use delve_core::{
    ConfigStore, DeepSearchService, EngineConfig, EventBus, EventBusHook, FileStore,
    MemoryStreamRegistry, RunHooks, StartRunRequest, Store, StreamRegistry, WorkflowOrchestrator,
    DEFAULT_ENGINE_HOST, DEFAULT_ENGINE_PORT,
};
use delve_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent,
    ProcessKind,
};
use delve_providers::scripted::ScriptedProvider;
use delve_providers::{Provider, ProviderRegistry};
use delve_server::{serve, AppState};
use delve_tools::scripted::{ScriptedAnalyzer, ScriptedReporter, ScriptedSearch, ScriptedSynthesizer};
use delve_tools::{CapabilitySet, ExaSearch, ModelAnalyzer, ModelReporter, ModelSynthesizer};
use delve_wire::StreamFrame;

const SUPPORTED_PROVIDER_IDS: [&str; 4] = ["openai", "openrouter", "ollama", "groq"];
const SCRIPTED_PROVIDER_ID: &str = "scripted";
const CLI_PRINCIPAL: &str = "cli";
const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "delve-engine")]
#[command(about = "Headless Delve deep search backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        #[arg(long, env = "DELVE_STATE_DIR")]
        state_dir: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    Run {
        prompt: String,
        #[arg(long)]
        api_key: Option<String>,
        /// Provider id, or `scripted` for an offline smoke run.
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            api_key,
            provider,
            model,
            config,
        } => {
            let overrides = build_cli_overrides(api_key, provider, model)?;
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent {
                    status: Some("ok"),
                    detail: Some("engine jsonl logging initialized"),
                    ..ObservabilityEvent::new("logging.initialized", "engine.main")
                },
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .with_context(|| format!("invalid listen address {hostname}:{port}"))?;
            let config_path = config
                .map(PathBuf::from)
                .unwrap_or_else(|| state_dir.join("config.json"));
            log_startup_paths(&state_dir, &config_path, &addr);

            let config_store = ConfigStore::new(&config_path, overrides).await?;
            let cfg = config_store.get().await;
            let providers = ProviderRegistry::new(cfg.providers_config());
            let store: Arc<dyn Store> = Arc::new(FileStore::new(state_dir.join("storage")).await?);
            let registry: Arc<dyn StreamRegistry> = Arc::new(MemoryStreamRegistry::new(
                Duration::from_secs(cfg.streams.retention_secs),
            ));
            let event_bus = EventBus::new();
            let service = build_service(
                &cfg,
                store,
                registry,
                model_capabilities(&cfg, providers.clone()),
                providers.clone(),
                Some(event_bus.clone()),
            );
            let state = AppState::new(service, event_bus, providers);
            serve(addr, state).await?;
        }
        Command::Run {
            prompt,
            api_key,
            provider,
            model,
            config,
        } => {
            let offline = provider
                .as_deref()
                .is_some_and(|p| p.trim().eq_ignore_ascii_case(SCRIPTED_PROVIDER_ID));
            let (cfg, providers, capabilities) = if offline {
                let cfg = EngineConfig::default();
                let scripted: Arc<dyn Provider> = Arc::new(
                    ScriptedProvider::new(SCRIPTED_PROVIDER_ID)
                        .with_fallback("This is an offline answer from the scripted provider."),
                );
                let providers = ProviderRegistry::with_providers(
                    vec![scripted],
                    Some(SCRIPTED_PROVIDER_ID.to_string()),
                );
                (cfg, providers, scripted_capabilities())
            } else {
                let overrides = build_cli_overrides(api_key, provider.clone(), model.clone())?;
                let config_path = config
                    .map(PathBuf::from)
                    .unwrap_or_else(|| resolve_state_dir(None).join("config.json"));
                let cfg = ConfigStore::new(&config_path, overrides).await?.get().await;
                let providers = ProviderRegistry::new(cfg.providers_config());
                let capabilities = model_capabilities(&cfg, providers.clone());
                (cfg, providers, capabilities)
            };

            let model = resolve_run_model(&providers, provider.as_deref(), model.as_deref()).await?;
            let store: Arc<dyn Store> = Arc::new(FileStore::ephemeral());
            let registry: Arc<dyn StreamRegistry> = Arc::new(MemoryStreamRegistry::new(
                Duration::from_secs(cfg.streams.retention_secs),
            ));
            let service = build_service(&cfg, store, registry, capabilities, providers, None);
            let handle = service
                .start_run(
                    CLI_PRINCIPAL,
                    StartRunRequest {
                        session_id: Some(Uuid::new_v4().to_string()),
                        model: Some(model),
                        prompt: Some(prompt),
                    },
                )
                .await?;

            let mut frames = handle.frames;
            let mut stdout = std::io::stdout();
            while let Some(frame) = frames.next().await {
                match frame.frame()? {
                    StreamFrame::TextDelta { delta, .. } => {
                        write!(stdout, "{delta}")?;
                        stdout.flush()?;
                    }
                    StreamFrame::Error { error_text } => eprintln!("error: {error_text}"),
                    _ => {}
                }
            }
            writeln!(stdout)?;

            let outcome = handle.task.await?;
            if let Some(error) = outcome.error {
                anyhow::bail!("run ended in {}: {}", outcome.state.as_str(), error);
            }
        }
    }

    Ok(())
}

fn build_service(
    cfg: &EngineConfig,
    store: Arc<dyn Store>,
    registry: Arc<dyn StreamRegistry>,
    capabilities: CapabilitySet,
    providers: ProviderRegistry,
    event_bus: Option<EventBus>,
) -> DeepSearchService {
    let mut hooks = RunHooks::new();
    if let Some(bus) = event_bus {
        hooks.register(Arc::new(EventBusHook::new(bus)));
    }
    let orchestrator =
        WorkflowOrchestrator::new(store.clone(), capabilities, providers, cfg.workflow.clone())
            .with_hooks(hooks)
            .with_channel_capacity(cfg.streams.channel_capacity);
    DeepSearchService::new(store, registry, orchestrator)
}

fn model_capabilities(cfg: &EngineConfig, providers: ProviderRegistry) -> CapabilitySet {
    CapabilitySet::new()
        .with(Arc::new(ModelAnalyzer::new(providers.clone())))
        .with(Arc::new(ExaSearch::new(cfg.search.clone())))
        .with(Arc::new(ModelSynthesizer::new(providers.clone())))
        .with(Arc::new(ModelReporter::new(providers)))
}

fn scripted_capabilities() -> CapabilitySet {
    CapabilitySet::new()
        .with(Arc::new(ScriptedAnalyzer::direct()))
        .with(Arc::new(ScriptedSearch::new()))
        .with(Arc::new(ScriptedSynthesizer::done()))
        .with(Arc::new(ScriptedReporter::new("offline report")))
}

/// Resolves `provider/model` for a one-shot run. A `--model` that already
/// names its provider wins; otherwise the provider's first listed model is
/// used.
async fn resolve_run_model(
    providers: &ProviderRegistry,
    provider: Option<&str>,
    model: Option<&str>,
) -> anyhow::Result<String> {
    let model = model.map(str::trim).filter(|m| !m.is_empty());
    if let Some(model) = model.filter(|m| m.contains('/')) {
        return Ok(model.to_string());
    }
    let provider = provider.map(|p| p.trim().to_lowercase());
    let selected = providers.select_provider(provider.as_deref()).await?;
    let info = selected.info();
    let model_id = match model {
        Some(model) => model.to_string(),
        None => info
            .models
            .first()
            .map(|m| m.id.clone())
            .with_context(|| format!("provider `{}` lists no models; pass --model", info.id))?,
    };
    Ok(format!("{}/{}", info.id, model_id))
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // api key and model land on the selected provider, openai otherwise
    let target_provider = provider.as_deref().unwrap_or("openai");

    // a provider-qualified model is resolved per run, not stored as a default
    let model = model.filter(|m| !m.contains('/'));
    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }
        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert("providers".to_string(), serde_json::Value::Object(providers));
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("DELVE_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".delve")
}

fn log_startup_paths(state_dir: &Path, config_path: &Path, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting delve-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={} config_path={}",
        exe.display(),
        cwd.display(),
        state_dir.display(),
        config_path.display()
    );
}
