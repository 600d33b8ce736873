//! Host claim tracking.
//!
//! # Responsibilities
//! - Map each claimed host to the connection that owns it
//! - Enforce last-writer-wins on competing claims
//! - Release a dead connection's claims without touching hosts that
//!   were already reassigned
//!
//! # Design Decisions
//! - Host matching is exact and case-insensitive (hosts are lowercased
//!   on the way in, as in HTTP)
//! - The registry holds connection ids, never connection handles: it is
//!   a revocable reference and must not extend a connection's lifetime

use dashmap::DashMap;
use uuid::Uuid;

/// The `host → connection id` claim table. One per handler instance.
#[derive(Debug, Default)]
pub struct HostRegistry {
    claims: DashMap<String, Uuid>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            claims: DashMap::new(),
        }
    }

    /// Claim a host for a connection. A later claim displaces an
    /// earlier one; the displaced owner is returned so the caller can
    /// log it.
    pub fn register(&self, host: &str, owner: Uuid) -> Option<Uuid> {
        self.claims
            .insert(host.to_ascii_lowercase(), owner)
            .filter(|previous| *previous != owner)
    }

    /// The connection currently owning a host, if any.
    pub fn lookup(&self, host: &str) -> Option<Uuid> {
        self.claims
            .get(&host.to_ascii_lowercase())
            .map(|entry| *entry.value())
    }

    /// Drop every listed claim that still points at `owner`. Hosts
    /// displaced to another connection in the meantime are left alone.
    /// Returns how many claims were actually removed.
    pub fn release(&self, hosts: &[String], owner: Uuid) -> usize {
        hosts
            .iter()
            .filter(|host| {
                self.claims
                    .remove_if(host.as_str(), |_, current| *current == owner)
                    .is_some()
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_owner_per_host() {
        let registry = HostRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(registry.register("x.test", a), None);
        assert_eq!(registry.lookup("x.test"), Some(a));

        // Last writer wins.
        assert_eq!(registry.register("x.test", b), Some(a));
        assert_eq!(registry.lookup("x.test"), Some(b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = HostRegistry::new();
        let owner = Uuid::new_v4();
        registry.register("App.Test", owner);
        assert_eq!(registry.lookup("app.test"), Some(owner));
        assert_eq!(registry.lookup("APP.TEST"), Some(owner));
    }

    #[test]
    fn release_skips_displaced_hosts() {
        let registry = HostRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        registry.register("x.test", a);
        registry.register("y.test", a);
        registry.register("x.test", b);

        // A's teardown removes only what still points at A.
        let removed = registry.release(&["x.test".into(), "y.test".into()], a);
        assert_eq!(removed, 1);
        assert_eq!(registry.lookup("x.test"), Some(b));
        assert_eq!(registry.lookup("y.test"), None);
    }

    #[test]
    fn re_registering_own_host_is_not_a_displacement() {
        let registry = HostRegistry::new();
        let a = Uuid::new_v4();
        registry.register("x.test", a);
        assert_eq!(registry.register("x.test", a), None);
    }
}
