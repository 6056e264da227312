use super::routes::{router, AppState};
use captioning::{env_or, load_engine, EngineConfig};
use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub body_limit: usize,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            // This listens on IPv6 and IPv4
            addr: env_or("API_SERVER_ADDR", SocketAddr::from(([0u16; 8], 3001)))?,
            body_limit: env_or("API_SERVER_BODY_LIMIT", 32 * 1024 * 1024)?,
        })
    }
}

pub async fn start_server() -> anyhow::Result<()> {
    // also loads .env, so it goes before any config
    analytics_tracing::init_tracing();

    let engine_config = EngineConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;

    let image_caption = load_engine(&engine_config).await?;
    let app = router(AppState { image_caption }, server_config.body_limit);

    let listener = tokio::net::TcpListener::bind(server_config.addr).await?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl-C received, shut down...");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, shut down...");
        },
    }
}

#[cfg(test)]
mod test {
    use super::ServerConfig;

    #[test]
    fn test_server_config_defaults() {
        std::env::remove_var("API_SERVER_ADDR");
        std::env::remove_var("API_SERVER_BODY_LIMIT");
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.addr.to_string(), "[::]:3001");
        assert_eq!(config.body_limit, 33554432);
    }
}
