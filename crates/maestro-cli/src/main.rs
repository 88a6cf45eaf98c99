use clap::{Parser, Subcommand};
use maestro_agent::{AgentClient, HttpAgentTransport, RetryPolicy};
use maestro_core::{CoreConfig, LogSink};
use maestro_gateway::{ApiAuth, AppState, GatewayServer};
use maestro_orchestrator::{HeuristicPlanner, Scheduler};
use maestro_policy::{AuditLog, JsonlAuditSink, PolicyEngine, PolicyLoader};
use maestro_registry::{AgentRecord, AgentRegistry};
use maestro_session::SessionStore;
use maestro_tools::{
    AnalyticsTool, DatabaseQueryTool, DocumentSearchTool, HttpBackendConnector, ToolAuth,
    ToolServer, ToolServerConfig,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro — multi-agent orchestration core")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestration gateway
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
    },
    /// Policy document utilities
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Parse and validate a policy document
    Validate {
        /// Path to the policy TOML
        path: PathBuf,
    },
}

#[derive(Debug, Deserialize)]
struct AuthTokenEntry {
    token: String,
    user_id: Option<String>,
    role: String,
}

#[derive(Debug, Deserialize)]
struct AgentSeed {
    id: String,
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
    endpoint: String,
    max_capacity: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MaestroConfig {
    core: CoreConfig,
    data_dir: Option<PathBuf>,
    auth_tokens: Vec<AuthTokenEntry>,
    agents: Vec<AgentSeed>,
    /// Backend service name → base URL for the built-in tool adapters.
    tool_backends: HashMap<String, String>,
}

async fn load_config(path: &PathBuf) -> anyhow::Result<MaestroConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(MaestroConfig::default());
    }
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(toml::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => {
            let config = load_config(&cli.config).await?;
            serve(config, &host, port).await
        }
        Commands::Policy { action } => match action {
            PolicyAction::Validate { path } => {
                let loader = PolicyLoader::from_path(path.clone());
                match loader.load().await {
                    Ok(doc) => {
                        println!(
                            "{} ok: {} role(s), {} restriction(s), default '{}'",
                            path.display(),
                            doc.roles.len(),
                            doc.restrictions.len(),
                            doc.default_policy
                        );
                        Ok(())
                    }
                    Err(e) => {
                        eprintln!("{}: {e}", path.display());
                        std::process::exit(1);
                    }
                }
            }
        },
    }
}

async fn serve(config: MaestroConfig, host: &str, port: u16) -> anyhow::Result<()> {
    let core = config.core;

    // Audit trail, optionally mirrored to JSONL on disk.
    let audit = match &config.data_dir {
        Some(dir) => Arc::new(
            AuditLog::new(4096).with_sink(Arc::new(JsonlAuditSink::new(dir.join("audit")))),
        ),
        None => Arc::new(AuditLog::new(4096)),
    };

    // Policy: provider-less loader over the configured document, swapped
    // atomically on reload.
    let policy_loader = Arc::new(PolicyLoader::new(None, core.policy.path.clone()));
    let document = policy_loader.load().await?;
    let policy = Arc::new(PolicyEngine::new(document, audit));

    // Registry, optionally seeded from configuration; agents may also
    // self-register over the gateway.
    let registry = Arc::new(AgentRegistry::new(core.registry.heartbeat_timeout()));
    for seed in config.agents {
        let mut record = AgentRecord::new(
            seed.id.clone(),
            seed.name,
            seed.capabilities,
            seed.endpoint,
        );
        if let Some(capacity) = seed.max_capacity {
            record = record.with_capacity(capacity);
        }
        if let Err(e) = registry.register(record).await {
            warn!(agent_id = %seed.id, error = %e, "seed agent rejected");
        }
    }

    let sessions = SessionStore::new(core.session.clone());
    let shutdown = CancellationToken::new();
    let sweeper = sessions.spawn_sweeper(shutdown.clone());

    let client = AgentClient::new(
        Arc::new(HttpAgentTransport::new()),
        RetryPolicy::from(&core.agent_client),
    );
    let scheduler = Arc::new(
        Scheduler::new(
            registry.clone(),
            policy.clone(),
            sessions.clone(),
            client,
            Arc::new(HeuristicPlanner),
            core.scheduler.clone(),
        )
        .with_telemetry(Arc::new(LogSink)),
    );

    let mut tool_auth = ToolAuth::new(core.policy.default_role.clone());
    let mut api_auth = ApiAuth::new();
    for entry in config.auth_tokens {
        tool_auth = tool_auth.with_token(
            entry.token.clone(),
            entry.user_id.clone(),
            entry.role.clone(),
        );
        api_auth = api_auth.with_token(entry.token, entry.user_id, entry.role);
    }

    let mut tools = ToolServer::new(tool_auth, policy.clone(), ToolServerConfig::default())
        .with_telemetry(Arc::new(LogSink));
    if !config.tool_backends.is_empty() {
        let connector = Arc::new(HttpBackendConnector::new(config.tool_backends));
        tools.register(Arc::new(DatabaseQueryTool::new(connector.clone())));
        tools.register(Arc::new(DocumentSearchTool::new(connector.clone())));
        tools.register(Arc::new(AnalyticsTool::new(connector)));
    }

    let state = Arc::new(AppState {
        sessions,
        registry,
        policy: policy.clone(),
        policy_loader: policy_loader.clone(),
        scheduler,
        tools: Arc::new(tools),
        auth: api_auth,
    });

    if core.policy.reload_on_signal {
        spawn_policy_reload_on_hangup(policy_loader, policy);
    }

    let app = GatewayServer::build(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "maestro gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested, draining");
        })
        .await?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}

#[cfg(unix)]
fn spawn_policy_reload_on_hangup(loader: Arc<PolicyLoader>, policy: Arc<PolicyEngine>) {
    tokio::spawn(async move {
        let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "cannot install SIGHUP handler");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            info!("SIGHUP received, reloading policy");
            if let Err(e) = loader.reload_into(&policy).await {
                warn!(error = %e, "policy reload failed, old policy stays active");
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_policy_reload_on_hangup(_loader: Arc<PolicyLoader>, _policy: Arc<PolicyEngine>) {}
