use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an externally supplied identifier (e.g. a stage role id
            /// like "ideator") without minting a new uuid.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(AgentId, "agent");
branded_id!(RealmId, "realm");
branded_id!(ProcessId, "proc");
branded_id!(FindingId, "find");
branded_id!(SpectatorId, "spec");
branded_id!(ClientId, "client");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_has_prefix() {
        let id = AgentId::new();
        assert!(id.as_str().starts_with("agent_"), "got: {id}");
    }

    #[test]
    fn client_id_has_prefix() {
        let id = ClientId::new();
        assert!(id.as_str().starts_with("client_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = AgentId::new();
        let b = AgentId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_keeps_role_ids_verbatim() {
        let id = AgentId::from_raw("ideator");
        assert_eq!(id.as_str(), "ideator");
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = RealmId::new();
        let s = id.to_string();
        let parsed: RealmId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_roundtrip_is_transparent() {
        let id = AgentId::from_raw("scout");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"scout\"");
        let parsed: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn monotonic_ordering() {
        let ids: Vec<ProcessId> = (0..100).map(|_| ProcessId::new()).collect();
        for w in ids.windows(2) {
            assert!(w[0].as_str() < w[1].as_str(), "not monotonic: {} >= {}", w[0], w[1]);
        }
    }
}
