//! Known ledger networks and their public WebSocket endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Networks with a built-in endpoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Devnet,
    Xahau,
    XahauTestnet,
}

impl Network {
    pub const ALL: [Network; 5] = [
        Network::Mainnet,
        Network::Testnet,
        Network::Devnet,
        Network::Xahau,
        Network::XahauTestnet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Devnet => "devnet",
            Network::Xahau => "xahau",
            Network::XahauTestnet => "xahau-testnet",
        }
    }

    /// Public endpoints, in failover order.
    pub fn default_endpoints(&self) -> Vec<String> {
        let urls: &[&str] = match self {
            Network::Mainnet => &[
                "wss://xrplcluster.com",
                "wss://s1.ripple.com",
                "wss://s2.ripple.com",
            ],
            Network::Testnet => &["wss://s.altnet.rippletest.net:51233"],
            Network::Devnet => &["wss://s.devnet.rippletest.net:51233"],
            Network::Xahau => &["wss://xahau.network"],
            Network::XahauTestnet => &["wss://xahau-test.net"],
        };
        urls.iter().map(|u| u.to_string()).collect()
    }

    pub fn network_id(&self) -> u32 {
        match self {
            Network::Mainnet => 0,
            Network::Testnet => 1,
            Network::Devnet => 2,
            Network::Xahau => 21337,
            Network::XahauTestnet => 21338,
        }
    }

    /// Transactions on networks with an ID above 1024 must carry `NetworkID`.
    pub fn requires_network_id(&self) -> bool {
        self.network_id() > 1024
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown network: {0}")]
pub struct UnknownNetwork(pub String);

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "mainnet" | "main" | "xrpl" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "devnet" | "dev" => Ok(Network::Devnet),
            "xahau" | "xahau-mainnet" => Ok(Network::Xahau),
            "xahau-testnet" | "xahau-test" => Ok(Network::XahauTestnet),
            other => Err(UnknownNetwork(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("xahau_testnet".parse::<Network>().unwrap(), Network::XahauTestnet);
        assert!("solana".parse::<Network>().is_err());
    }

    #[test]
    fn test_network_id_requirement() {
        assert!(!Network::Mainnet.requires_network_id());
        assert!(!Network::Testnet.requires_network_id());
        assert!(Network::Xahau.requires_network_id());
        assert!(Network::XahauTestnet.requires_network_id());
    }

    #[test]
    fn test_every_network_has_endpoints() {
        for network in Network::ALL {
            let endpoints = network.default_endpoints();
            assert!(!endpoints.is_empty());
            assert!(endpoints.iter().all(|u| u.starts_with("wss://")));
        }
    }
}
