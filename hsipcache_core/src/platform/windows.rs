//! Windows-specific platform code for hsipcache

/// Session-local mapping name; `Global\` would need SeCreateGlobalPrivilege.
pub fn make_os_id(prefix: &str, hash: u64) -> String {
    format!("Local\\{prefix}{hash:016x}")
}

/// Named mappings vanish with their last handle, nothing to unlink.
pub fn platform_drop(_os_id: &str) {}
