use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use landtable::api::{build_router, App};
use landtable::backends::BackendResolver;
use state::{EtcdStore, LandtableState};

/// Landtable is a gateway which maps a logical workspace/table/field data
/// model onto physical databases.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Args {
    /// Etcd endpoints holding the gateway's metadata.
    #[arg(
        long,
        env = "ETCD_ENDPOINTS",
        default_value = "http://127.0.0.1:2379",
        value_delimiter = ','
    )]
    etcd_endpoints: Vec<String>,
    /// The port to listen on for API requests.
    #[arg(long, default_value = "8080", env = "API_PORT")]
    api_port: u16,
}

fn main() -> Result<(), anyhow::Error> {
    // Use reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(if matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1") {
            false
        } else {
            true
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn async_main(args: Args) -> Result<(), anyhow::Error> {
    // Bind early in the application lifecycle, to not fail requests which may
    // dispatch as soon as the process is up.
    let listener = tokio::net::TcpListener::bind(format!("[::]:{}", args.api_port))
        .await
        .context("failed to bind server port")?;

    let kv = EtcdStore::connect(&args.etcd_endpoints)
        .await
        .context("connecting to etcd")?;
    let state = LandtableState::new(Arc::new(kv));
    state.connect().await.context("loading gateway metadata")?;

    let mut backends = BackendResolver::new();
    backends.initialise().await.map_err(anyhow::Error::new)?;

    let app = Arc::new(App {
        state: state.clone(),
        backends,
    });
    let router = build_router(app);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving the api")?;

    // The watcher is stopped before the process (and its store client) goes
    // away.
    state.shutdown().await;
    Ok(())
}
