//! Path Helpers
//!
//! Locations of per-org plan directories and project map caches under the
//! server's base directory.

use std::path::{Path, PathBuf};

/// Resolve the server base directory: `$PLANDEX_BASE_DIR`, else
/// `~/.local/share/plandex-server`, else `./plandex-data`.
pub fn default_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PLANDEX_BASE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("plandex-server"))
        .unwrap_or_else(|| PathBuf::from("plandex-data"))
}

/// `<base>/orgs/<orgId>/plans/<planId>/`
pub fn plan_dir(base: &Path, org_id: &str, plan_id: &str) -> PathBuf {
    base.join("orgs").join(org_id).join("plans").join(plan_id)
}

/// `<base>/orgs/<orgId>/projects/<projectId>/map-cache/`
pub fn map_cache_dir(base: &Path, org_id: &str, project_id: &str) -> PathBuf {
    base.join("orgs")
        .join(org_id)
        .join("projects")
        .join(project_id)
        .join("map-cache")
}

/// Map cache shard file for a project path: `<md5(path)>.json`.
pub fn map_cache_file(base: &Path, org_id: &str, project_id: &str, path: &str) -> PathBuf {
    let digest = md5::compute(path.as_bytes());
    map_cache_dir(base, org_id, project_id).join(format!("{:x}.json", digest))
}
