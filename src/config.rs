use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

/// Which delegate launches machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfrastructureKind {
    Capi,
    Kwok,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown infrastructure {0:?}, expected capi or kwok")]
pub struct UnknownInfrastructure(String);

impl FromStr for InfrastructureKind {
    type Err = UnknownInfrastructure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "capi" => Ok(Self::Capi),
            "kwok" => Ok(Self::Kwok),
            _ => Err(UnknownInfrastructure(s.to_string())),
        }
    }
}

impl fmt::Display for InfrastructureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capi => write!(f, "capi"),
            Self::Kwok => write!(f, "kwok"),
        }
    }
}

#[derive(Debug, Envconfig)]
pub struct Config {
    /// YAML instance type catalog.
    #[envconfig(from = "CATALOG_PATH", default = "/etc/capi-provider/catalog.yaml")]
    pub catalog_path: String,

    #[envconfig(from = "CATALOG_REFRESH_SECONDS", default = "300")]
    pub catalog_refresh_seconds: u64,

    #[envconfig(from = "INFRASTRUCTURE", default = "capi")]
    pub infrastructure: InfrastructureKind,

    #[envconfig(from = "HEALTH_ADDR", default = "0.0.0.0:8081")]
    pub health_addr: SocketAddr,
}

impl Config {
    pub fn catalog_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_seconds.max(1))
    }
}
