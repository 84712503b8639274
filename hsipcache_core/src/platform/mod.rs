//! Platform-specific naming and cleanup of shared regions

#[cfg(target_os = "windows")]
pub mod windows;
#[cfg(unix)]
pub mod unix;

#[cfg(target_os = "windows")]
pub use windows::{make_os_id, platform_drop};
#[cfg(unix)]
pub use unix::{make_os_id, platform_drop};
