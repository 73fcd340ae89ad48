//! Filesystem adapter over the kernel (spec §4.11).
//!
//! Grounded on `ccos::capabilities::providers::local_file_provider`'s
//! operation-id naming idiom (`ccos.fs.read`, `ccos.fs.write`, ...),
//! adapted into this kernel's `arbor://fs/<op>/<path>` resource URIs. The
//! symlink- and traversal-safe resolver has no teacher analogue and is
//! written directly from spec.md §4.11 using the standard
//! canonicalize-then-prefix-check idiom.
//!
//! Per-capability pattern/exclude/max-depth constraints (distinct from the
//! `time_window`/`allowed_paths`/`rate_limit` set in
//! [`crate::constraints`]) ride in `Capability::metadata` as JSON, reusing
//! the capability model's existing free-form extension point rather than
//! adding new typed fields only this adapter needs.

use crate::capability::store::CapabilityStore;
use crate::error::{CapabilityError, FileGuardError, KernelError, KernelResult};
use std::path::{Path, PathBuf};

const METADATA_PATTERNS_KEY: &str = "fs_patterns";
const METADATA_EXCLUDE_KEY: &str = "fs_exclude";
const METADATA_MAX_DEPTH_KEY: &str = "fs_max_depth";

/// `arbor://fs/<op>/<normalized path without leading slash>` (spec §4.11
/// step 1).
pub fn build_uri(op: &str, path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    let normalized = normalized.trim_start_matches('/');
    format!("arbor://fs/{op}/{normalized}")
}

/// Resolve `requested`, which must be absolute, against `root` using a
/// symlink-safe canonicalization and reject anything that escapes `root`.
fn resolve_within_root(root: &Path, requested: &Path) -> Result<PathBuf, FileGuardError> {
    if !requested.is_absolute() {
        return Err(FileGuardError::InvalidPath(
            "requested path must be absolute".to_string(),
        ));
    }
    let canonical_root = root
        .canonicalize()
        .map_err(|e| FileGuardError::InvalidPath(e.to_string()))?;

    // The leaf component may not exist yet (e.g. a file about to be
    // written), so canonicalize its parent and rejoin the file name.
    let canonical_requested = match requested.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let parent = requested
                .parent()
                .ok_or_else(|| FileGuardError::InvalidPath("path has no parent".to_string()))?;
            let file_name = requested
                .file_name()
                .ok_or_else(|| FileGuardError::InvalidPath("path has no file name".to_string()))?;
            parent
                .canonicalize()
                .map_err(|e| FileGuardError::InvalidPath(e.to_string()))?
                .join(file_name)
        }
    };

    if canonical_requested == canonical_root || canonical_requested.starts_with(&canonical_root) {
        Ok(canonical_requested)
    } else {
        Err(FileGuardError::PathTraversal)
    }
}

/// Derive the filesystem root a capability grants access to from its
/// resource URI: `arbor://fs/<op>/<root>` → `/<root>`.
fn root_from_resource_uri(resource_uri: &str, op: &str) -> Option<PathBuf> {
    let prefix = format!("arbor://fs/{op}/");
    resource_uri
        .strip_prefix(&prefix)
        .map(|rest| PathBuf::from("/").join(rest))
}

fn check_patterns(metadata: &std::collections::HashMap<String, String>, basename: &str) -> Result<(), FileGuardError> {
    if let Some(raw) = metadata.get(METADATA_PATTERNS_KEY) {
        let patterns: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
        if !patterns.is_empty() {
            let matches = patterns
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .any(|p| p.matches(basename));
            if !matches {
                return Err(FileGuardError::PatternMismatch);
            }
        }
    }
    if let Some(raw) = metadata.get(METADATA_EXCLUDE_KEY) {
        let excludes: Vec<String> = serde_json::from_str(raw).unwrap_or_default();
        let excluded = excludes
            .iter()
            .filter_map(|p| glob::Pattern::new(p).ok())
            .any(|p| p.matches(basename));
        if excluded {
            return Err(FileGuardError::ExcludedPattern);
        }
    }
    Ok(())
}

fn check_max_depth(
    metadata: &std::collections::HashMap<String, String>,
    root: &Path,
    resolved: &Path,
) -> Result<(), FileGuardError> {
    let Some(raw) = metadata.get(METADATA_MAX_DEPTH_KEY) else {
        return Ok(());
    };
    let Ok(max_depth) = raw.parse::<usize>() else {
        return Ok(());
    };
    let depth = resolved
        .strip_prefix(root)
        .map(|rest| rest.components().count())
        .unwrap_or(0);
    if depth > max_depth {
        Err(FileGuardError::MaxDepthExceeded)
    } else {
        Ok(())
    }
}

/// Find the capability `agent_id` holds over `path` for `op`, resolve
/// `path` safely against that capability's root, and enforce its
/// pattern/exclude/max-depth constraints.
pub fn authorize(
    store: &CapabilityStore,
    agent_id: &str,
    path: &Path,
    op: &str,
) -> KernelResult<PathBuf> {
    let uri = build_uri(op, path);
    let cap = store
        .find_authorizing(agent_id, &uri)
        .ok_or_else(|| KernelError::Capability(CapabilityError::CapabilityNotFound(uri.clone())))?;

    let root = root_from_resource_uri(&cap.resource_uri, op)
        .ok_or_else(|| FileGuardError::InvalidPath(cap.resource_uri.clone()))?;

    let absolute_requested = PathBuf::from("/").join(path.to_string_lossy().trim_start_matches('/'));
    let resolved = resolve_within_root(&root, &absolute_requested)?;

    let basename = resolved
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    check_patterns(&cap.metadata, basename)?;
    check_max_depth(&cap.metadata, &root, &resolved)?;

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::model::Capability;
    use crate::capability::persistence::InMemoryPersistence;
    use crate::capability::store::QuotaLimits;
    use std::sync::Arc;

    fn store() -> CapabilityStore {
        CapabilityStore::new(
            QuotaLimits {
                max_per_principal: 100,
                max_global: 100,
                max_delegation_depth: 10,
            },
            Arc::new(InMemoryPersistence::new()),
        )
    }

    #[test]
    fn build_uri_strips_leading_slash() {
        assert_eq!(
            build_uri("read", Path::new("/home/docs/x.txt")),
            "arbor://fs/read/home/docs/x.txt"
        );
    }

    #[tokio::test]
    async fn authorize_resolves_within_granted_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/x.txt"), b"hi").unwrap();

        let root_uri = build_uri("read", dir.path());
        let store = store();
        store
            .put(Capability::new(root_uri, "agent_x".to_string()))
            .await
            .unwrap();

        let resolved = authorize(&store, "agent_x", &dir.path().join("docs/x.txt"), "read").unwrap();
        assert_eq!(resolved, dir.path().join("docs/x.txt").canonicalize().unwrap());
    }

    #[tokio::test]
    async fn authorize_rejects_traversal_outside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sandbox")).unwrap();

        let root_uri = build_uri("read", &dir.path().join("sandbox"));
        let store = store();
        store
            .put(Capability::new(root_uri, "agent_x".to_string()))
            .await
            .unwrap();

        let outside = dir.path().join("sandbox/../outside.txt");
        let result = authorize(&store, "agent_x", &outside, "read");
        assert_eq!(result, Err(KernelError::FileGuard(FileGuardError::PathTraversal)));
    }

    #[tokio::test]
    async fn pattern_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secret.env"), b"x").unwrap();

        let mut cap = Capability::new(build_uri("read", dir.path()), "agent_x".to_string());
        cap.metadata.insert(
            METADATA_PATTERNS_KEY.to_string(),
            serde_json::to_string(&["*.txt"]).unwrap(),
        );
        let store = store();
        store.put(cap).await.unwrap();

        let result = authorize(&store, "agent_x", &dir.path().join("secret.env"), "read");
        assert_eq!(result, Err(KernelError::FileGuard(FileGuardError::PatternMismatch)));
    }
}
