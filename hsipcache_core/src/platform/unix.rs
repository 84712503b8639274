//! Unix-specific platform code for hsipcache

use log::warn;

/// POSIX shm names must start with a slash and stay short on macOS.
pub fn make_os_id(prefix: &str, hash: u64) -> String {
    format!("/{prefix}{hash:016x}")
}

/// Unlink the named region. Mappings other processes still hold stay valid.
pub fn platform_drop(os_id: &str) {
    use std::ffi::CString;
    let Ok(c_name) = CString::new(os_id) else {
        return;
    };
    let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if rc != 0 {
        let err = errno::errno();
        if err.0 != libc::ENOENT {
            warn!("shm_unlink({os_id}) failed: {err}");
        }
    }
}
