//! Connector roles.
//!
//! A connector is either the accepting (server) or the dialing (client) end
//! of its transport, and is either part of the fully-meshed core or a
//! dependent that only talks through core peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which end of the transport a connector is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Accepts peers.
    Server,
    /// Dials a server.
    Client,
}

/// How a connector participates in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Membership {
    /// Fully-meshed backbone.
    Core,
    /// Reaches the ecology only through core peers.
    Dependent,
}

/// Role of a connector: `{Server, Client} × {Core, Dependent}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectorRole {
    CoreServer,
    CoreClient,
    DependentServer,
    DependentClient,
}

impl ConnectorRole {
    /// Build a role from its two components.
    #[must_use]
    pub const fn new(side: Side, membership: Membership) -> Self {
        match (side, membership) {
            (Side::Server, Membership::Core) => ConnectorRole::CoreServer,
            (Side::Client, Membership::Core) => ConnectorRole::CoreClient,
            (Side::Server, Membership::Dependent) => ConnectorRole::DependentServer,
            (Side::Client, Membership::Dependent) => ConnectorRole::DependentClient,
        }
    }

    #[must_use]
    pub const fn side(self) -> Side {
        match self {
            ConnectorRole::CoreServer | ConnectorRole::DependentServer => Side::Server,
            ConnectorRole::CoreClient | ConnectorRole::DependentClient => Side::Client,
        }
    }

    #[must_use]
    pub const fn membership(self) -> Membership {
        match self {
            ConnectorRole::CoreServer | ConnectorRole::CoreClient => Membership::Core,
            ConnectorRole::DependentServer | ConnectorRole::DependentClient => {
                Membership::Dependent
            }
        }
    }

    #[must_use]
    pub const fn is_core(self) -> bool {
        matches!(self.membership(), Membership::Core)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectorRole::CoreServer => "core-server",
            ConnectorRole::CoreClient => "core-client",
            ConnectorRole::DependentServer => "dependent-server",
            ConnectorRole::DependentClient => "dependent-client",
        }
    }
}

impl fmt::Display for ConnectorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "core-server" => Ok(ConnectorRole::CoreServer),
            "core-client" => Ok(ConnectorRole::CoreClient),
            "dependent-server" => Ok(ConnectorRole::DependentServer),
            "dependent-client" => Ok(ConnectorRole::DependentClient),
            other => Err(format!("Unknown connector role: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_components() {
        for side in [Side::Server, Side::Client] {
            for membership in [Membership::Core, Membership::Dependent] {
                let role = ConnectorRole::new(side, membership);
                assert_eq!(role.side(), side);
                assert_eq!(role.membership(), membership);
            }
        }
        assert!(ConnectorRole::CoreClient.is_core());
        assert!(!ConnectorRole::DependentClient.is_core());
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(
            "dependent-client".parse::<ConnectorRole>(),
            Ok(ConnectorRole::DependentClient)
        );
        assert!("sideways".parse::<ConnectorRole>().is_err());
        assert_eq!(ConnectorRole::CoreServer.to_string(), "core-server");
    }
}
