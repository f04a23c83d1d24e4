//! Configuration for the registry daemon

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Registry daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Listen address (e.g., "127.0.0.1:4500")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:4500".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl RegistryConfig {
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
