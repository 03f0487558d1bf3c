//! Permission checks performed before capability-bearing tools run.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// What a tool needs to be allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Execute,
    Network,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Execute => "execute",
            Capability::Network => "network",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied(String),
}

impl Permission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Permission::Granted)
    }
}

/// Decides whether a capability may be exercised on a resource.
///
/// Implementations may prompt a user, consult a policy file, or both.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn check(&self, capability: Capability, resource: &str) -> Permission;
}

/// Grants everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PermissionGate for AllowAll {
    async fn check(&self, _capability: Capability, _resource: &str) -> Permission {
        Permission::Granted
    }
}

/// Static policy: a set of allowed capabilities plus resource prefixes that
/// are always denied.
#[derive(Debug, Clone, Default)]
pub struct CapabilityPolicy {
    allowed: HashSet<Capability>,
    denied_prefixes: Vec<String>,
}

impl CapabilityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access only.
    pub fn read_only() -> Self {
        Self::new().allow(Capability::Read)
    }

    pub fn allow(mut self, capability: Capability) -> Self {
        self.allowed.insert(capability);
        self
    }

    pub fn deny_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.denied_prefixes.push(prefix.into());
        self
    }
}

#[async_trait]
impl PermissionGate for CapabilityPolicy {
    async fn check(&self, capability: Capability, resource: &str) -> Permission {
        if let Some(prefix) = self.denied_prefixes.iter().find(|p| resource.starts_with(p.as_str())) {
            return Permission::Denied(format!("access to '{resource}' is blocked ({prefix})"));
        }
        if self.allowed.contains(&capability) {
            Permission::Granted
        } else {
            Permission::Denied(format!("{capability} capability is not granted"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_grants() {
        assert!(AllowAll.check(Capability::Execute, "rm -rf /tmp/x").await.is_granted());
    }

    #[tokio::test]
    async fn policy_checks_capability_then_prefix() {
        let policy = CapabilityPolicy::read_only().deny_prefix("/etc");
        assert!(policy.check(Capability::Read, "src/main.rs").await.is_granted());
        assert!(!policy.check(Capability::Write, "src/main.rs").await.is_granted());
        match policy.check(Capability::Read, "/etc/passwd").await {
            Permission::Denied(reason) => assert!(reason.contains("/etc")),
            Permission::Granted => panic!("expected denial"),
        }
    }
}
