use serde::{Deserialize, Serialize};

/// Public STUN servers used when the caller provides no ICE configuration.
pub const DEFAULT_STUN_SERVERS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// ICE configuration for the underlying peer transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServerConfig {
                    urls: vec![(*url).to_string()],
                    username: String::new(),
                    credential: String::new(),
                })
                .collect(),
        }
    }
}

impl IceConfig {
    /// No STUN/TURN at all, for same-host connections.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
        }
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls,
            username: String::new(),
            credential: String::new(),
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServerConfig {
            urls,
            username,
            credential,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_public_stun_servers() {
        let config = IceConfig::default();
        assert_eq!(config.ice_servers.len(), 3);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn localhost_config_is_empty() {
        assert!(IceConfig::localhost().ice_servers.is_empty());
    }
}
