//! HTTP mediation gateway between a coding-agent CLI and the host
//! filesystem.
//!
//! Callers POST declarative tasks; the gateway validates them against
//! policy, runs the agent as a supervised subprocess inside a bounded
//! workspace, redacts secrets from everything it serves, and persists the
//! full interaction for audit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;

use agent_firewall::config::Config;
use agent_firewall::core::prompt::PromptBuilder;
use agent_firewall::gate::Gate;
use agent_firewall::http::routes;
use agent_firewall::http::state::AppState;
use agent_firewall::io::store::SessionStore;
use agent_firewall::logging;
use agent_firewall::supervisor::{CliAgentRunner, Supervisor};

#[derive(Parser)]
#[command(
    name = "agent-firewall",
    version,
    about = "HTTP mediation gateway for coding-agent subprocesses"
)]
struct Args {
    /// Override the bind address from AGENTFW_BIND.
    #[arg(long)]
    bind: Option<String>,

    /// Override the listen port from AGENTFW_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Override the session data directory from AGENTFW_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let args = Args::parse();

    let mut config = Config::from_env().context("load configuration")?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    config.validate().context("validate configuration")?;
    let config = Arc::new(config);

    let store = Arc::new(SessionStore::new(config.data_dir.clone()));

    // Crash recovery must complete before the listener binds so no request
    // can observe a stale running session.
    let recovered = store
        .mark_aborted_on_startup()
        .context("startup recovery")?;
    if recovered > 0 {
        info!(recovered, "aborted stale running sessions");
    }

    let gate = Arc::new(Gate::new());
    let prompts = Arc::new(
        PromptBuilder::new(config.prompt_append.as_deref())
            .map_err(|err| anyhow!("invalid prompt append: {err}"))?,
    );
    let supervisor = Arc::new(Supervisor {
        store: store.clone(),
        gate: gate.clone(),
        runner: Arc::new(CliAgentRunner),
        agent_bin: config.agent_bin.clone(),
        output_limit_bytes: config.output_limit_bytes,
        kill_grace: config.kill_grace(),
    });

    let state = AppState {
        config: config.clone(),
        store,
        gate,
        supervisor,
        prompts,
        cancel_flags: Arc::new(Mutex::new(HashMap::new())),
    };
    let app = routes::api_router(state);

    let addr: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .context("parse bind address")?;
    info!(%addr, data_dir = %config.data_dir.display(), agent = %config.agent_bin, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;
    axum::serve(listener, app).await.context("serve")?;

    Ok(())
}
