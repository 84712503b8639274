//! Error handling and C-ABI error codes for hsipcache

use std::cell::RefCell;
use std::fmt;
use std::os::raw::c_char;

/// Errors raised by the writer and setup paths. The lookup path never fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    CapacityExceeded,
    ZeroCapacity,
    InvalidPrefix,
    /// An existing region was created with a different layout or capacity.
    HeaderMismatch,
    InvalidConfig(String),
    Lock(String),
    Shmem(String),
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::CapacityExceeded => f.write_str("trie capacity exceeded"),
            Error::ZeroCapacity => f.write_str("trie opened with zero capacity"),
            Error::InvalidPrefix => f.write_str("invalid prefix length"),
            Error::HeaderMismatch => {
                f.write_str("shared region exists with a different version or capacity")
            }
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Lock(msg) => write!(f, "lock error: {msg}"),
            Error::Shmem(msg) => write!(f, "shared memory error: {msg}"),
            Error::Other(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_owned())
    }
}

impl From<shared_memory::ShmemError> for Error {
    fn from(e: shared_memory::ShmemError) -> Self {
        Error::Shmem(e.to_string())
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    CapacityExceeded = 1,
    ZeroCapacity = 2,
    InvalidPrefix = 3,
    HeaderMismatch = 4,
    InvalidHandle = 5,
    Utf8Error = 6,
    LockFailed = 7,
    ShmemOpenFailed = 8,
    InvalidConfig = 9,
    NotFound = 12,
    Unknown = 255,
}

impl ErrorCode {
    /// NUL-terminated so the same bytes can be handed across the C ABI.
    pub fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::CapacityExceeded => b"Capacity exceeded\0",
            ErrorCode::ZeroCapacity => b"Zero capacity\0",
            ErrorCode::InvalidPrefix => b"Invalid prefix\0",
            ErrorCode::HeaderMismatch => b"Region header mismatch\0",
            ErrorCode::InvalidHandle => b"Invalid handle\0",
            ErrorCode::Utf8Error => b"UTF-8 conversion error\0",
            ErrorCode::LockFailed => b"Lock operation failed\0",
            ErrorCode::ShmemOpenFailed => b"Shared memory open failed\0",
            ErrorCode::InvalidConfig => b"Invalid configuration\0",
            ErrorCode::NotFound => b"Not found\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }

    pub fn as_str(self) -> &'static str {
        let bytes = self.as_cstr();
        // every literal above is ASCII
        std::str::from_utf8(&bytes[..bytes.len() - 1]).unwrap_or("Unknown error")
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn hsip_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn hsip_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

/// Map an internal error onto its C-ABI code.
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::CapacityExceeded => ErrorCode::CapacityExceeded,
        Error::ZeroCapacity => ErrorCode::ZeroCapacity,
        Error::InvalidPrefix => ErrorCode::InvalidPrefix,
        Error::HeaderMismatch => ErrorCode::HeaderMismatch,
        Error::InvalidConfig(_) => ErrorCode::InvalidConfig,
        Error::Lock(_) => ErrorCode::LockFailed,
        Error::Shmem(_) => ErrorCode::ShmemOpenFailed,
        Error::Other(_) => ErrorCode::Unknown,
    }
}
