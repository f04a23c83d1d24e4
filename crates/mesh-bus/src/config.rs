//! Configuration for service-process buses

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::liveness::LivenessConfig;

/// Bus configuration for one service process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Registry address
    #[serde(default = "default_registry_addr")]
    pub registry_addr: String,

    /// Seconds between liveness pings
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before declaring the peer dead
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,

    /// Whether ping/pong traffic is logged
    #[serde(default)]
    pub ping_logs: bool,
}

fn default_registry_addr() -> String {
    "127.0.0.1:4500".to_string()
}

fn default_ping_interval_secs() -> u64 {
    5
}

fn default_pong_timeout_secs() -> u64 {
    15
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            registry_addr: default_registry_addr(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            ping_logs: false,
        }
    }
}

impl BusConfig {
    /// Liveness settings derived from this configuration.
    pub fn liveness(&self) -> LivenessConfig {
        LivenessConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            ping_logs: self.ping_logs,
        }
    }

    /// Load configuration from file. YAML for `.yaml`/`.yml`, JSON otherwise.
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use futures::io::AsyncReadExt;

        let mut file = async_fs::File::open(path.as_ref()).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        let extension = path.as_ref().extension().and_then(|s| s.to_str());
        if extension == Some("yaml") || extension == Some("yml") {
            Ok(serde_yaml::from_str(&contents)?)
        } else {
            Ok(serde_json::from_str(&contents)?)
        }
    }
}
