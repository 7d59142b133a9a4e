use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{
    loopback, SidecarConfig, DEFAULT_CONFIG_ENV, DEFAULT_GATEWAY_COMMAND, DEFAULT_GATEWAY_PORT,
    DEFAULT_HOME, DEFAULT_HOST, DEFAULT_PORT,
};
use crate::gateway_logs::{LogRecorder, DEFAULT_LOG_CAPACITY};
use crate::router::{build_router_with_state, AppState};
use crate::supervisor::{ReadinessPolicy, RestartPolicy};

#[derive(Parser, Debug)]
#[command(name = "gateway-sidecar", bin_name = "gateway-sidecar")]
#[command(
    about = "Supervises the agent gateway, fronts its HTTP port and persists its state",
    version
)]
pub struct SidecarCli {
    #[arg(long, short = 'H', env = "SIDECAR_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Home directory forced on the sidecar and the gateway.
    #[arg(long, env = "SIDECAR_HOME", default_value = DEFAULT_HOME)]
    home_dir: PathBuf,

    #[arg(long, env = "GATEWAY_PORT", default_value_t = DEFAULT_GATEWAY_PORT)]
    gateway_port: u16,

    #[arg(long, env = "GATEWAY_COMMAND", default_value = DEFAULT_GATEWAY_COMMAND)]
    gateway_command: PathBuf,

    /// Extra argument for the gateway; repeatable.
    #[arg(long = "gateway-arg", allow_hyphen_values = true)]
    gateway_args: Vec<String>,

    /// Environment variable holding the gateway configuration blob.
    #[arg(long, default_value = DEFAULT_CONFIG_ENV)]
    config_env: String,

    #[arg(long, env = "SIDECAR_LOG_CAPACITY", default_value_t = DEFAULT_LOG_CAPACITY)]
    log_capacity: usize,
}

impl SidecarCli {
    fn into_config(self) -> SidecarConfig {
        let config_blob = std::env::var(&self.config_env)
            .ok()
            .filter(|blob| !blob.is_empty());
        SidecarConfig {
            host: self.host,
            port: self.port,
            home_dir: self.home_dir,
            gateway_addr: loopback(self.gateway_port),
            gateway_program: self.gateway_command,
            gateway_args: self.gateway_args,
            config_blob,
            log_capacity: self.log_capacity,
            restart: RestartPolicy::default(),
            readiness: ReadinessPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_sidecar() -> Result<(), CliError> {
    let cli = SidecarCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    let config = cli.into_config();

    // No other threads exist yet, so the change is observed consistently by
    // everything the runtime spawns later, the gateway included.
    std::env::set_var("HOME", &config.home_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;
    runtime.block_on(serve(config))
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub async fn serve(config: SidecarConfig) -> Result<(), CliError> {
    let logs = Arc::new(LogRecorder::new(config.log_capacity));
    logs.system("runner starting");

    let state = Arc::new(AppState::new(&config, logs.clone())?);
    let router = build_router_with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    logs.system(format!(
        "runner listening on {addr} (proxy -> {})",
        config.gateway_addr
    ));
    tracing::info!(
        addr = %addr,
        gateway = %config.gateway_addr,
        state_dir = %config.state_dir().display(),
        "sidecar listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| CliError::Server(err.to_string()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_container_layout() {
        let cli = SidecarCli::try_parse_from(["gateway-sidecar", "--config-env", "SIDECAR_TEST_UNSET_BLOB"])
            .expect("parse");
        assert_eq!(cli.log_capacity, DEFAULT_LOG_CAPACITY);
        let config = cli.into_config();
        assert_eq!(config.gateway_addr.port(), DEFAULT_GATEWAY_PORT);
        assert!(config.config_blob.is_none());
        assert!(config.gateway_args.is_empty());
    }

    #[test]
    fn gateway_args_are_repeatable() {
        let cli = SidecarCli::try_parse_from([
            "gateway-sidecar",
            "--gateway-port",
            "19000",
            "--gateway-command",
            "/usr/local/bin/gw",
            "--gateway-arg",
            "serve",
            "--gateway-arg",
            "--verbose",
        ])
        .expect("parse");
        let config = cli.into_config();
        assert_eq!(config.gateway_addr.to_string(), "127.0.0.1:19000");
        assert_eq!(config.gateway_program, PathBuf::from("/usr/local/bin/gw"));
        assert_eq!(config.gateway_args, vec!["serve", "--verbose"]);
    }
}
