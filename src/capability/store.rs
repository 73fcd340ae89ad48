//! Indexed, quota-enforcing capability store (spec §4.7).
//!
//! Grounded on `ccos::capability_marketplace::marketplace`'s indexed
//! in-memory catalog shape (by-id lookup with versioned records), extended
//! here with `dashmap`-backed secondary lookup indices (by-principal,
//! by-issuer, by-parent) kept in lockstep with the primary table, since no
//! teacher file needed that much indexing for a read-mostly catalog. This
//! store is mutable, quota-checked, and cascade-revocable.

use super::model::Capability;
use super::persistence::CapabilityPersistence;
use crate::error::CapabilityError;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub max_per_principal: usize,
    pub max_global: usize,
    pub max_delegation_depth: u32,
}

pub struct CapabilityStore {
    by_id: DashMap<String, Capability>,
    by_principal: DashMap<String, Vec<String>>,
    by_issuer: DashMap<String, Vec<String>>,
    by_parent: DashMap<String, Vec<String>>,
    quotas: QuotaLimits,
    persistence: Arc<dyn CapabilityPersistence>,
}

impl std::fmt::Debug for CapabilityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityStore")
            .field("count", &self.by_id.len())
            .finish_non_exhaustive()
    }
}

impl CapabilityStore {
    pub fn new(quotas: QuotaLimits, persistence: Arc<dyn CapabilityPersistence>) -> Self {
        Self {
            by_id: DashMap::new(),
            by_principal: DashMap::new(),
            by_issuer: DashMap::new(),
            by_parent: DashMap::new(),
            quotas,
            persistence,
        }
    }

    /// Replay every capability the persistence backend already holds into
    /// the in-memory indices, bypassing quota checks (they were already
    /// enforced when these capabilities were originally granted).
    pub async fn load_from_persistence(&self) -> std::io::Result<()> {
        for cap in self.persistence.list().await? {
            if cap.is_expired() {
                continue;
            }
            self.index(cap);
        }
        Ok(())
    }

    fn index(&self, cap: Capability) {
        self.by_principal
            .entry(cap.principal_id.clone())
            .or_default()
            .push(cap.id.clone());
        if let Some(issuer_id) = &cap.issuer_id {
            self.by_issuer.entry(issuer_id.clone()).or_default().push(cap.id.clone());
        }
        if let Some(parent_id) = &cap.parent_capability_id {
            self.by_parent.entry(parent_id.clone()).or_default().push(cap.id.clone());
        }
        self.by_id.insert(cap.id.clone(), cap);
    }

    fn deindex(&self, cap: &Capability) {
        self.by_id.remove(&cap.id);
        if let Some(mut ids) = self.by_principal.get_mut(&cap.principal_id) {
            ids.retain(|id| id != &cap.id);
        }
        if let Some(issuer_id) = &cap.issuer_id {
            if let Some(mut ids) = self.by_issuer.get_mut(issuer_id) {
                ids.retain(|id| id != &cap.id);
            }
        }
        if let Some(parent_id) = &cap.parent_capability_id {
            if let Some(mut ids) = self.by_parent.get_mut(parent_id) {
                ids.retain(|id| id != &cap.id);
            }
        }
    }

    /// Insert a new capability grant, enforcing the per-principal and
    /// global quota ceilings (spec §6, §8 quota scenario). Delegation-depth
    /// quota is enforced by the caller at delegation time, since it is a
    /// property of the delegation operation rather than of storage.
    pub async fn put(&self, cap: Capability) -> Result<(), CapabilityError> {
        if self.by_id.contains_key(&cap.id) {
            if let Err(e) = self.persistence.put(&cap).await {
                tracing::warn!(capability_id = %cap.id, error = %e, "capability persistence write failed, continuing with in-memory state");
            }
            self.index(cap);
            return Ok(());
        }

        if self.by_id.len() >= self.quotas.max_global {
            return Err(CapabilityError::QuotaExceeded {
                kind: "max_global_capabilities".to_string(),
                ctx: Default::default(),
            });
        }
        let per_principal = self
            .by_principal
            .get(&cap.principal_id)
            .map(|ids| ids.len())
            .unwrap_or(0);
        if per_principal >= self.quotas.max_per_principal {
            let mut ctx = std::collections::HashMap::new();
            ctx.insert("principal_id".to_string(), cap.principal_id.clone());
            return Err(CapabilityError::QuotaExceeded {
                kind: "max_capabilities_per_agent".to_string(),
                ctx,
            });
        }

        if let Err(e) = self.persistence.put(&cap).await {
            tracing::warn!(capability_id = %cap.id, error = %e, "capability persistence write failed, continuing with in-memory state");
        }
        self.index(cap);
        Ok(())
    }

    /// Look up a capability by id. Returns `CapabilityExpired` for an
    /// entry that has outlived its `expires_at` but has not yet been
    /// swept, rather than silently treating it as missing.
    pub fn get(&self, id: &str) -> Result<Capability, CapabilityError> {
        let cap = self
            .by_id
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| CapabilityError::CapabilityNotFound(id.to_string()))?;
        if cap.is_expired() {
            return Err(CapabilityError::CapabilityExpired(cap.id));
        }
        Ok(cap)
    }

    /// Exceeding `max_delegation_depth` for a would-be child whose parent
    /// has delegation-chain length `parent_chain_len`.
    pub fn delegation_depth_exceeded(&self, parent_chain_len: usize) -> bool {
        parent_chain_len + 1 > self.quotas.max_delegation_depth as usize
    }

    /// The first unexpired capability owned by `principal_id` that
    /// authorizes `resource` (spec §4.6: "find an authorizing capability").
    pub fn find_authorizing(&self, principal_id: &str, resource: &str) -> Option<Capability> {
        let ids = self.by_principal.get(principal_id)?;
        ids.iter()
            .filter_map(|id| self.by_id.get(id))
            .find(|cap| !cap.is_expired() && cap.authorizes_resource(resource))
            .map(|e| e.clone())
    }

    /// Remove a single capability, leaving any children it had delegated
    /// intact (their `parent_capability_id` becomes dangling).
    pub async fn revoke(&self, id: &str) -> Result<(), CapabilityError> {
        let cap = self
            .by_id
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| CapabilityError::CapabilityNotFound(id.to_string()))?;
        self.deindex(&cap);
        let _ = self.persistence.delete(id).await;
        Ok(())
    }

    /// Revoke `id` and every capability transitively delegated from it
    /// (spec §4.7, §8 cascade-revoke scenario). Collects the full subtree
    /// before removing anything, so a concurrent reader never observes a
    /// capability whose parent has already vanished.
    pub async fn cascade_revoke(&self, id: &str) -> Result<Vec<String>, CapabilityError> {
        if !self.by_id.contains_key(id) {
            return Err(CapabilityError::CapabilityNotFound(id.to_string()));
        }
        let mut to_revoke = vec![id.to_string()];
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            if let Some(children) = self.by_parent.get(&current) {
                for child_id in children.iter() {
                    to_revoke.push(child_id.clone());
                    frontier.push(child_id.clone());
                }
            }
        }
        for revoked_id in &to_revoke {
            if let Some(cap) = self.by_id.get(revoked_id).map(|e| e.clone()) {
                self.deindex(&cap);
                let _ = self.persistence.delete(revoked_id).await;
            }
        }
        Ok(to_revoke)
    }

    /// Revoke every capability owned by `principal_id`.
    pub async fn revoke_all(&self, principal_id: &str) -> Vec<String> {
        let ids = self
            .by_principal
            .get(principal_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut revoked = Vec::new();
        for id in ids {
            if self.revoke(&id).await.is_ok() {
                revoked.push(id);
            }
        }
        revoked
    }

    /// Sweep every expired capability out of the store. Intended to run on
    /// a periodic timer alongside the rate-limit bucket sweeper.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<Capability> = self
            .by_id
            .iter()
            .filter(|e| e.expires_at.map(|exp| exp < now).unwrap_or(false))
            .map(|e| e.clone())
            .collect();
        for cap in &expired {
            self.deindex(cap);
            let _ = self.persistence.delete(&cap.id).await;
        }
        expired.len()
    }

    /// Every capability currently held by `principal_id`, expired or not
    /// (spec §6 `list_capabilities`).
    pub fn list_by_principal(&self, principal_id: &str) -> Vec<Capability> {
        self.by_principal
            .get(principal_id)
            .map(|ids| ids.iter().filter_map(|id| self.by_id.get(id).map(|e| e.clone())).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::persistence::InMemoryPersistence;

    fn store(max_per_principal: usize, max_global: usize) -> CapabilityStore {
        CapabilityStore::new(
            QuotaLimits {
                max_per_principal,
                max_global,
                max_delegation_depth: 10,
            },
            Arc::new(InMemoryPersistence::new()),
        )
    }

    #[tokio::test]
    async fn put_then_find_authorizing() {
        let store = store(10, 10);
        let cap = Capability::new("arbor://fs/read/home".into(), "agent_x".into());
        store.put(cap.clone()).await.unwrap();
        let found = store.find_authorizing("agent_x", "arbor://fs/read/home/doc.txt").unwrap();
        assert_eq!(found.id, cap.id);
    }

    #[tokio::test]
    async fn per_principal_quota_is_enforced() {
        let store = store(1, 10);
        store
            .put(Capability::new("arbor://fs/read/a".into(), "agent_x".into()))
            .await
            .unwrap();
        let result = store
            .put(Capability::new("arbor://fs/read/b".into(), "agent_x".into()))
            .await;
        assert!(matches!(result, Err(CapabilityError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn cascade_revoke_removes_whole_subtree() {
        let store = store(10, 10);
        let root = Capability::new("arbor://fs/read/home".into(), "agent_root".into());
        store.put(root.clone()).await.unwrap();

        let mut child = Capability::new("arbor://fs/read/home/docs".into(), "agent_child".into());
        child.parent_capability_id = Some(root.id.clone());
        store.put(child.clone()).await.unwrap();

        let mut grandchild = Capability::new("arbor://fs/read/home/docs/x".into(), "agent_grandchild".into());
        grandchild.parent_capability_id = Some(child.id.clone());
        store.put(grandchild.clone()).await.unwrap();

        let revoked = store.cascade_revoke(&root.id).await.unwrap();
        assert_eq!(revoked.len(), 3);
        assert!(store.get(&root.id).is_err());
        assert!(store.get(&child.id).is_err());
        assert!(store.get(&grandchild.id).is_err());
    }

    #[tokio::test]
    async fn sweep_expired_removes_only_expired() {
        let store = store(10, 10);
        let fresh = Capability::new("arbor://fs/read/home".into(), "agent_x".into());
        let expired = Capability::new("arbor://fs/read/other".into(), "agent_x".into())
            .with_expiry(Utc::now() - chrono::Duration::seconds(1));
        store.put(fresh.clone()).await.unwrap();
        store.put(expired.clone()).await.unwrap();

        let swept = store.sweep_expired().await;
        assert_eq!(swept, 1);
        assert!(store.get(&fresh.id).is_ok());
        assert!(store.get(&expired.id).is_err());
    }

    #[tokio::test]
    async fn get_reports_expired_before_it_is_swept() {
        let store = store(10, 10);
        let expired = Capability::new("arbor://fs/read/home".into(), "agent_x".into())
            .with_expiry(Utc::now() - chrono::Duration::seconds(1));
        store.put(expired.clone()).await.unwrap();

        assert_eq!(
            store.get(&expired.id),
            Err(CapabilityError::CapabilityExpired(expired.id.clone()))
        );
    }

    #[tokio::test]
    async fn list_by_principal_returns_only_that_principals_grants() {
        let store = store(10, 10);
        store
            .put(Capability::new("arbor://fs/read/a".into(), "agent_x".into()))
            .await
            .unwrap();
        store
            .put(Capability::new("arbor://fs/read/b".into(), "agent_x".into()))
            .await
            .unwrap();
        store
            .put(Capability::new("arbor://fs/read/c".into(), "agent_y".into()))
            .await
            .unwrap();

        assert_eq!(store.list_by_principal("agent_x").len(), 2);
        assert_eq!(store.list_by_principal("agent_y").len(), 1);
        assert!(store.list_by_principal("agent_unknown").is_empty());
    }
}
