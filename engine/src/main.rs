use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing::info;
use uuid::Uuid;

use skiff_core::{
    ActorDeps, ConfigStore, FileSessionStore, InitializeRequest, LogUsageSink, MemorySessionStore,
    SendMessageRequest, SessionRegistry, SessionStore, SkiffConfig,
};
use skiff_observability::{
    canonical_logs_dir_from_root, init_process_logging, record_milestone, redact_text, Milestone,
    ProcessKind,
};
use skiff_relay::OpenCodeClient;
use skiff_sandbox::HttpLifecycleProvider;
use skiff_types::{SessionSecrets, SessionStatus};

/// Extra wait on top of the health budget for provisioning and cloning.
const BOOT_GRACE: Duration = Duration::from_secs(180);
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "skiff-engine")]
#[command(about = "Drive a sandboxed coding-agent session from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot a sandbox, send one prompt and stream the agent's events.
    Run {
        #[arg(long)]
        prompt: String,
        /// `owner/name` to clone into the workspace.
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long, env = "SKIFF_CONTROLLER_URL")]
        controller_url: Option<String>,
        /// Leave the session and its sandbox running afterwards.
        #[arg(long, default_value_t = false)]
        keep: bool,
    },
    /// Print the effective configuration and the layers it came from.
    Config {
        #[arg(long)]
        config: Option<String>,
        /// JSON object merged into the config file before printing. Tokens
        /// and keys in it apply to this run only and are never written.
        #[arg(long)]
        set: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            prompt,
            repo,
            config,
            session_id,
            state_dir,
            controller_url,
            keep,
        } => {
            let overrides = build_cli_overrides(state_dir, controller_url);
            let store = ConfigStore::new(resolve_config_path(config), overrides).await?;
            let config = store.get().await;

            let logs_dir = config
                .logging
                .dir
                .clone()
                .unwrap_or_else(|| canonical_logs_dir_from_root(&resolve_state_dir(&config)));
            let logging =
                init_process_logging(ProcessKind::Engine, &logs_dir, config.logging.retention_days)?;
            record_milestone(
                tracing::Level::INFO,
                ProcessKind::Engine,
                Milestone {
                    event: "engine.logging.initialized",
                    status: Some("ok"),
                    detail: Some(&logging.info.logs_dir),
                    ..Default::default()
                },
            );
            info!("engine logging initialized: {:?}", logging.info);

            let registry = build_registry(&config).await?;
            let session_id = session_id.unwrap_or_else(|| format!("ses_{}", Uuid::new_v4().simple()));
            run_session(&registry, &config, &session_id, prompt, repo, keep).await?;
        }
        Command::Config { config, set } => {
            let store = ConfigStore::new(resolve_config_path(config), None).await?;
            if let Some(raw) = set {
                let patch = parse_config_patch(&raw)?;
                store.patch_file(patch).await?;
            }
            let mut effective = store.get_effective_value().await;
            redact_config(&mut effective);
            let mut layers = store.get_layers_value().await;
            redact_config(&mut layers);
            let output = serde_json::json!({
                "effective": effective,
                "layers": layers,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

async fn run_session(
    registry: &SessionRegistry,
    config: &SkiffConfig,
    session_id: &str,
    prompt: String,
    repo: Option<String>,
    keep: bool,
) -> anyhow::Result<()> {
    let request = InitializeRequest {
        repo,
        source_token: env_value("GH_TOKEN"),
        secrets: secrets_from_env(),
    };
    let state = registry
        .initialize(session_id, &owner_id(), request)
        .await
        .with_context(|| format!("failed to initialize session {}", session_id))?;
    info!("session {} initialized ({})", state.id, state.status);

    let outcome = drive_turn(registry, config, session_id, prompt).await;

    if keep {
        info!("keeping session {} alive", session_id);
        eprintln!("session {} left running", session_id);
    } else {
        let ack = registry.terminate(session_id).await?;
        info!("session {} {}", session_id, ack.status);
    }
    outcome
}

async fn drive_turn(
    registry: &SessionRegistry,
    config: &SkiffConfig,
    session_id: &str,
    prompt: String,
) -> anyhow::Result<()> {
    let deadline = Instant::now() + config.health.budget(false) + BOOT_GRACE;
    loop {
        let state = registry.get_state(session_id).await?;
        if state.status != SessionStatus::Starting {
            break;
        }
        if Instant::now() >= deadline {
            anyhow::bail!("session {} is still starting; giving up", session_id);
        }
        tokio::time::sleep(STATE_POLL_INTERVAL).await;
    }

    let mut stream = match registry
        .send_message(session_id, SendMessageRequest::new(prompt))
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("{}", serde_json::to_string_pretty(&e.to_payload())?);
            return Err(e.into());
        }
    };
    while let Some(event) = stream.next().await {
        print!("{}", event.to_sse_line());
    }
    Ok(())
}

async fn build_registry(config: &SkiffConfig) -> anyhow::Result<SessionRegistry> {
    let store: Arc<dyn SessionStore> = match &config.storage.dir {
        Some(dir) => Arc::new(
            FileSessionStore::new(dir)
                .await
                .with_context(|| format!("failed to open session store at {:?}", dir))?,
        ),
        None => Arc::new(MemorySessionStore::new()),
    };
    let lifecycle = HttpLifecycleProvider {
        default_url: config.controller.url.clone(),
        default_token: config.controller.token.clone(),
        settings: config.sandbox.clone(),
        health: config.health.clone(),
        http: config.http.clone(),
        retry: config.retry.clone(),
    };
    let agent = OpenCodeClient::new(&config.http, &config.relay, config.retry.clone())?;
    let registry = SessionRegistry::new(ActorDeps {
        store,
        lifecycle: Arc::new(lifecycle),
        agent: Arc::new(agent),
        usage: Arc::new(LogUsageSink),
        relay: config.relay.clone(),
    });
    if config.storage.dir.is_some() {
        registry.restore().await?;
    }
    Ok(registry)
}

fn build_cli_overrides(
    state_dir: Option<String>,
    controller_url: Option<String>,
) -> Option<serde_json::Value> {
    if state_dir.is_none() && controller_url.is_none() {
        return None;
    }
    let mut root = serde_json::Map::new();
    if let Some(dir) = state_dir {
        root.insert("storage".to_string(), serde_json::json!({ "dir": dir }));
    }
    if let Some(url) = controller_url {
        root.insert("controller".to_string(), serde_json::json!({ "url": url }));
    }
    Some(serde_json::Value::Object(root))
}

fn resolve_config_path(flag: Option<String>) -> Option<PathBuf> {
    flag.map(PathBuf::from)
        .or_else(|| dirs::config_dir().map(|d| d.join("skiff").join("config.json")))
}

fn parse_config_patch(raw: &str) -> anyhow::Result<serde_json::Value> {
    let patch: serde_json::Value =
        serde_json::from_str(raw).context("--set expects a JSON object")?;
    if !patch.is_object() {
        anyhow::bail!("--set expects a JSON object, got {}", raw);
    }
    Ok(patch)
}

fn resolve_state_dir(config: &SkiffConfig) -> PathBuf {
    if let Some(dir) = &config.storage.dir {
        return dir.clone();
    }
    dirs::data_local_dir()
        .map(|d| d.join("skiff"))
        .unwrap_or_else(|| PathBuf::from(".skiff"))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn secrets_from_env() -> SessionSecrets {
    SessionSecrets {
        anthropic_api_key: env_value("ANTHROPIC_API_KEY"),
        controller_url: env_value("SKIFF_CONTROLLER_URL"),
        controller_token: env_value("SKIFF_CONTROLLER_TOKEN"),
        ..Default::default()
    }
}

fn owner_id() -> String {
    env_value("USER").unwrap_or_else(|| "cli".to_string())
}

fn redact_config(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map.iter_mut() {
                let redacted = (key == "token").then(|| nested.as_str().map(redact_text)).flatten();
                match redacted {
                    Some(redacted) => *nested = serde_json::Value::String(redacted),
                    None => redact_config(nested),
                }
            }
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact_config),
        _ => {}
    }
}
