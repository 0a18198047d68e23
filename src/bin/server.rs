use clap::Parser;
use facegate::audit::{AuditSink, JsonlAuditSink, NoopAuditSink};
use facegate::config::Config;
use facegate::credentials::StaticCredentials;
use facegate::crypto::ServerKeypair;
use facegate::dispatch::{DispatchContext, MatchDispatcher};
use facegate::face::dev::DevFaceEngine;
use facegate::face::{EmbeddingExtractor, LandmarkDetector};
use facegate::service::{serve, ServerContext};
use facegate::session::SessionRegistry;
use facegate::storage::VectorIndexStore;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "facegate-server")]
#[command(about = "Biometric access gate service")]
struct Args {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override
    #[arg(long)]
    listen: Option<String>,

    /// Development mode: debug logging, no credential requirement
    #[arg(long)]
    dev: bool,
}

fn main() -> facegate::Result<()> {
    let args = Args::parse();

    let default_level = if args.dev { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if args.dev {
        config.security.require_credentials = false;
    }
    config.validate()?;

    tracing::info!("Starting facegate service");

    let store_config = config.resolved_store();
    let store = Arc::new(VectorIndexStore::open(&store_config)?);
    tracing::info!(
        path = %store_config.index_path.display(),
        dimension = store_config.dimension,
        "Vector index ready"
    );

    let engine = Arc::new(DevFaceEngine::new());
    let registry = Arc::new(SessionRegistry::new());
    let audit: Arc<dyn AuditSink> = match &config.audit.log_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "Audit log enabled");
            Arc::new(JsonlAuditSink::open(path)?)
        }
        None => Arc::new(NoopAuditSink),
    };

    let dispatcher = MatchDispatcher::start(
        config.server.workers,
        DispatchContext {
            extractor: Arc::clone(&engine) as Arc<dyn EmbeddingExtractor>,
            store,
            registry: Arc::clone(&registry),
            audit,
        },
    );
    tracing::info!(workers = config.server.workers, "Dispatcher started");

    let context = Arc::new(ServerContext {
        keypair: ServerKeypair::generate()?,
        registry,
        dispatcher,
        credentials: Arc::new(StaticCredentials::new(
            config.security.api_keys.clone(),
            config.security.require_credentials,
        )),
        landmarks: Arc::clone(&engine) as Arc<dyn LandmarkDetector>,
        liveness: config.liveness.clone(),
        idle_timeout: Duration::from_secs(config.server.idle_timeout_secs),
        max_event_bytes: config.server.max_event_bytes,
    });

    let listener = TcpListener::bind(&config.server.listen_addr)?;
    serve(listener, context)
}
