//! Stable service identity through the work directory.
//!
//! The node's uuid lives in `<work_dir>/node-id` and survives restarts;
//! every in-process service derives its own identity from it so the
//! same machine always runs the same logical services.

use crate::errors::{SvcError, WorkDir};
use snafu::ResultExt;
use std::path::{Path, PathBuf};
use store_api::v0::uuid5;
use uuid::Uuid;

/// Default work directory
pub const DEF_WORK_DIR: &str = "/var/lib/genesis";

/// File holding the node's stable uuid
const NODE_ID_FILE: &str = "node-id";

/// Read the node's stable uuid, creating it on first start
pub fn node_uuid(work_dir: &Path) -> Result<Uuid, SvcError> {
    let path = work_dir.join(NODE_ID_FILE);
    if path.exists() {
        let raw = std::fs::read_to_string(&path).context(WorkDir {
            details: format!("reading {}", path.display()),
        })?;
        if let Ok(uuid) = raw.trim().parse::<Uuid>() {
            return Ok(uuid);
        }
        tracing::warn!("Replacing unparsable node id at {}", path.display());
    }

    std::fs::create_dir_all(work_dir).context(WorkDir {
        details: format!("creating {}", work_dir.display()),
    })?;
    let uuid = Uuid::new_v4();
    std::fs::write(&path, format!("{}\n", uuid)).context(WorkDir {
        details: format!("writing {}", path.display()),
    })?;
    Ok(uuid)
}

/// Deterministic identity of a named service on this node
pub fn service_uuid(node: &Uuid, name: &str) -> Uuid {
    uuid5(node, name)
}

/// Path of the pool agent's meta snapshot
pub fn pool_agent_meta_file(work_dir: &Path) -> PathBuf {
    work_dir.join("pool_agent_meta.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_uuid_is_stable_across_reads() {
        let dir = std::env::temp_dir().join(format!("workdir-{}", Uuid::new_v4()));
        let first = node_uuid(&dir).unwrap();
        let second = node_uuid(&dir).unwrap();
        assert_eq!(first, second);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn service_uuids_differ_per_name() {
        let node = Uuid::new_v4();
        assert_ne!(
            service_uuid(&node, "pool_builder"),
            service_uuid(&node, "machine_pool_agent")
        );
        assert_eq!(
            service_uuid(&node, "pool_builder"),
            service_uuid(&node, "pool_builder")
        );
    }
}
