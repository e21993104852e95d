#![forbid(unsafe_code)]

use std::{env, net::SocketAddr, sync::Arc};

use formvault_adapter::{router, AdapterRuntime, DEFAULT_HTTP_BIND, ENV_HTTP_BIND};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = env::var(ENV_HTTP_BIND).unwrap_or_else(|_| DEFAULT_HTTP_BIND.to_string());
    let addr: SocketAddr = bind.parse()?;

    let runtime = Arc::new(AdapterRuntime::default_from_env()?);
    let permissions_version = runtime.service().permissions().version();
    let app = router(runtime);

    info!(%addr, permissions_version, "formvault_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
