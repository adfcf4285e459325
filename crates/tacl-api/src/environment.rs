//! The fixed enumeration of remote service environments and the URL bases they map to.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the fixed set of deployments the client can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Environment {
    Prod,
    Alt,
    Test,
    EcProd,
    EcTest,
    Dev,
}

impl Environment {
    pub const ALL: [Environment; 6] = [
        Environment::Prod,
        Environment::Alt,
        Environment::Test,
        Environment::EcProd,
        Environment::EcTest,
        Environment::Dev,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Prod => "prod",
            Environment::Alt => "alt",
            Environment::Test => "test",
            Environment::EcProd => "ec-prod",
            Environment::EcTest => "ec-test",
            Environment::Dev => "dev",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "prod" => Some(Environment::Prod),
            "alt" => Some(Environment::Alt),
            "test" => Some(Environment::Test),
            "ec-prod" => Some(Environment::EcProd),
            "ec-test" => Some(Environment::EcTest),
            "dev" => Some(Environment::Dev),
            _ => None,
        }
    }

    /// Hostname for this environment. `dev` resolves to a local port instead of a real host.
    pub fn host(&self) -> &'static str {
        match self {
            Environment::Prod => "api.tsd.usit.no",
            Environment::Alt => "api.alt.tsd.usit.no",
            Environment::Test => "test.api.tsd.usit.no",
            Environment::EcProd => "ec-api.tsd.usit.no",
            Environment::EcTest => "ec-test.api.tsd.usit.no",
            Environment::Dev => "localhost:3001",
        }
    }

    /// `http` for `dev`, `https` otherwise.
    pub fn scheme(&self) -> &'static str {
        match self {
            Environment::Dev => "http",
            _ => "https",
        }
    }

    /// `https://<host>/v1`, or `http://localhost:<port>/v1` for `dev`.
    pub fn api_base(&self) -> String {
        format!("{}://{}/v1", self.scheme(), self.host())
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_as_str() {
        for env in Environment::ALL {
            assert_eq!(Environment::from_str(env.as_str()), Some(env));
        }
    }

    #[test]
    fn dev_uses_plain_http_and_a_local_port() {
        assert_eq!(Environment::Dev.scheme(), "http");
        assert!(Environment::Dev.api_base().starts_with("http://localhost"));
    }

    #[test]
    fn others_use_https() {
        for env in Environment::ALL {
            if env != Environment::Dev {
                assert!(env.api_base().starts_with("https://"));
            }
        }
    }
}
