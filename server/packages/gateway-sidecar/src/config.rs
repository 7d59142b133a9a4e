use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::gateway_logs::DEFAULT_LOG_CAPACITY;
use crate::paths::WORKSPACE_DIR;
use crate::supervisor::{GatewayLaunch, ReadinessPolicy, RestartPolicy};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOME: &str = "/root";
pub const DEFAULT_GATEWAY_PORT: u16 = 18790;
pub const DEFAULT_GATEWAY_COMMAND: &str = "picohost-gateway";
pub const DEFAULT_CONFIG_ENV: &str = "NANOBOT_CONFIG";
pub const STATE_DIR_NAME: &str = ".nanobot";

/// Runtime settings for one sidecar instance.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub host: String,
    pub port: u16,
    pub home_dir: PathBuf,
    pub gateway_addr: SocketAddr,
    pub gateway_program: PathBuf,
    pub gateway_args: Vec<String>,
    pub config_blob: Option<String>,
    pub log_capacity: usize,
    pub restart: RestartPolicy,
    pub readiness: ReadinessPolicy,
}

impl SidecarConfig {
    pub fn new(home_dir: impl Into<PathBuf>, gateway_port: u16) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            home_dir: home_dir.into(),
            gateway_addr: loopback(gateway_port),
            gateway_program: PathBuf::from(DEFAULT_GATEWAY_COMMAND),
            gateway_args: Vec::new(),
            config_blob: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
            restart: RestartPolicy::default(),
            readiness: ReadinessPolicy::default(),
        }
    }

    /// Root of everything the sidecar persists, `<home>/.nanobot`.
    pub fn state_dir(&self) -> PathBuf {
        state_dir_for(&self.home_dir)
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.state_dir().join(WORKSPACE_DIR)
    }

    pub fn gateway_launch(&self) -> GatewayLaunch {
        GatewayLaunch {
            program: self.gateway_program.clone(),
            args: self.gateway_args.clone(),
            home_dir: self.home_dir.clone(),
            config_blob: self.config_blob.clone(),
            config_path: self.state_dir().join("config.json"),
        }
    }
}

pub fn state_dir_for(home_dir: &Path) -> PathBuf {
    home_dir.join(STATE_DIR_NAME)
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}
