use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rusqlite::Connection;
use tracing::{error, info, warn};

use maia_auth::SessionShim;
use maia_core::config::MaiaConfig;
use maia_core::error::{ErrorKind, EXIT_CONFIG, EXIT_INTERNAL, EXIT_UNAVAILABLE, EXIT_USAGE};
use maia_experts::{builtin_experts, ActionLogger, Dispatcher, ExpertDeps};
use maia_llm::{EngineRouter, HttpEngine, LlmEngine};
use maia_memory::MemoryManager;
use maia_orchestrator::{GenerationDefaults, LlmSummarizer, Orchestrator};
use maia_outbound::{HttpTransport, OutboundClient, Service, ServiceEndpoints};
use maia_satisfaction::SatisfactionTracker;

mod app;
mod http;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maia_gateway=info,tower_http=debug".into()),
        )
        .init();

    // Usage: maia-gateway [--config <path>]
    let mut args = std::env::args().skip(1);
    let mut config_path = std::env::var("MAIA_CONFIG").ok();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => match args.next() {
                Some(path) => config_path = Some(path),
                None => {
                    eprintln!("--config requires a path");
                    return ExitCode::from(EXIT_USAGE as u8);
                }
            },
            other => {
                eprintln!("unknown argument: {other}");
                eprintln!("usage: maia-gateway [--config <path>]");
                return ExitCode::from(EXIT_USAGE as u8);
            }
        }
    }

    let config = match MaiaConfig::load(config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG as u8);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime start failed: {e}");
            return ExitCode::from(EXIT_INTERNAL as u8);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(ExitKind::Unavailable(msg)) => {
            error!("{msg}");
            ExitCode::from(EXIT_UNAVAILABLE as u8)
        }
        Err(ExitKind::Internal(msg)) => {
            error!("{msg}");
            ExitCode::from(EXIT_INTERNAL as u8)
        }
    }
}

enum ExitKind {
    Unavailable(String),
    Internal(String),
}

async fn run(config: MaiaConfig) -> Result<(), ExitKind> {
    let transport = Arc::new(HttpTransport::new());
    let endpoints =
        ServiceEndpoints::from_config(&config.services, config.auth.service_url.as_deref());
    let outbound = Arc::new(OutboundClient::new(transport, endpoints, &config.breaker));

    // In production the auth collaborator must be reachable before we serve.
    if !config.auth.local_dev_mode {
        match outbound.get(Service::Auth, "/api/auth/user").await {
            Err(e @ (ErrorKind::Unavailable(_) | ErrorKind::Timeout { .. })) => {
                return Err(ExitKind::Unavailable(format!(
                    "auth service unreachable at startup: {e}"
                )));
            }
            // Any HTTP-level answer (401 included) proves the service is up.
            _ => {}
        }
    }

    let open_db = |purpose: &str| -> Result<Connection, ExitKind> {
        Connection::open(&config.database.url)
            .map_err(|e| ExitKind::Internal(format!("open {purpose} database: {e}")))
    };

    let memory = Arc::new(
        MemoryManager::new(open_db("memory")?, config.episodes.clone())
            .map_err(|e| ExitKind::Internal(format!("memory schema: {e}")))?,
    );
    let action_log = Arc::new(
        ActionLogger::new(open_db("action log")?)
            .map_err(|e| ExitKind::Internal(format!("action log schema: {e}")))?,
    );
    let satisfaction = Arc::new(
        SatisfactionTracker::new(open_db("satisfaction")?)
            .map_err(|e| ExitKind::Internal(format!("satisfaction schema: {e}")))?,
    );

    let deps = ExpertDeps {
        outbound: outbound.clone(),
        memory: memory.clone(),
    };
    let dispatcher = Arc::new(Dispatcher::new(
        builtin_experts(&deps),
        action_log.clone(),
        &config.experts,
    ));

    let mut engines: Vec<Arc<dyn LlmEngine>> =
        vec![Arc::new(HttpEngine::new(config.llm.primary_endpoint.clone(), None))];
    for endpoint in &config.llm.fallback_endpoints {
        engines.push(Arc::new(HttpEngine::new(endpoint.clone(), None)));
    }
    let llm = Arc::new(EngineRouter::new(
        engines,
        config.llm.default_model.clone(),
        config.llm.models.clone(),
    ));

    let orchestrator = Orchestrator::new(
        memory.clone(),
        dispatcher,
        llm.clone(),
        satisfaction.clone(),
        GenerationDefaults {
            max_tokens: config.llm.max_tokens,
            temperature: config.llm.temperature,
        },
    );
    let shim = SessionShim::new(outbound.clone(), config.auth.local_dev_mode);

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState {
        config,
        shim,
        orchestrator,
        memory: memory.clone(),
        satisfaction,
        action_log: action_log.clone(),
        outbound,
        ready: AtomicBool::new(false),
    });

    // Background tasks: episode sweeper, action-log flusher, LLM warm-up.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let summarizer: Arc<dyn maia_memory::sweeper::Summarizer> =
        Arc::new(LlmSummarizer::new(llm.clone()));
    tokio::spawn(maia_memory::sweeper::run_sweeper(
        memory,
        Some(summarizer),
        shutdown_rx.clone(),
    ));
    tokio::spawn(maia_experts::action_log::run_flusher(
        action_log,
        shutdown_rx,
    ));
    {
        let state = state.clone();
        tokio::spawn(async move {
            // Readiness is signalled when warm-up completes or its cap
            // elapses, whichever comes first.
            if !llm.warm_up().await {
                warn!("LLM warm-up hit its time cap");
            }
            state.ready.store(true, Ordering::Relaxed);
            info!("gateway ready");
        });
    }

    let router = app::build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(|e| ExitKind::Internal(format!("bind address: {e}")))?;
    info!("maia gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ExitKind::Unavailable(format!("bind {addr}: {e}")))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .map_err(|e| ExitKind::Internal(format!("server error: {e}")))?;

    Ok(())
}
