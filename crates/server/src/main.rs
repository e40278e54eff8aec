mod cli;
mod routes;
mod state;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cardforge_engine::dispatcher::{DispatcherConfig, start_dispatcher};

use crate::cli::Cli;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cardforge=info,cardforge_engine=info,tower_http=info")),
        )
        .init();

    let cli = Cli::parse();
    tokio::fs::create_dir_all(&cli.data_dir).await?;

    let (state, dispatcher) = AppState::build(&cli).await?;
    let dispatcher_handle = start_dispatcher(dispatcher, DispatcherConfig::default());

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("cardforge {} listening on {}", env!("CARGO_PKG_VERSION"), listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let the dispatcher finish its current invocation before exiting.
    dispatcher_handle.request_stop();
    dispatcher_handle.wait().await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown requested; finishing in-flight work");
}
