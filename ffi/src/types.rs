//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! The handle is opaque: C only ever holds a pointer to it and mutates it
//! through setopt calls. Results cross the boundary as a heap-allocated
//! `FfiTransferResult` whose strings are owned C strings, released together
//! by `transfer_free_result`.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;

use transfer_core::{ConnectError, TransferError, TransferOptions, TransferResult};

/// Body callback: receives `len` bytes at `data` plus the `WRITEDATA`
/// pointer. Returning anything other than `len` aborts the transfer.
pub type FfiWriteCallback =
    extern "C" fn(data: *const u8, len: usize, user_data: *mut c_void) -> usize;

/// Receives one `(name, value)` pair per exported option constant.
pub type FfiConstantCallback =
    extern "C" fn(name: *const c_char, value: u32, user_data: *mut c_void);

/// Opaque transfer handle. C callers receive a pointer to this and pass it
/// back into every `transfer_*` function.
pub struct FfiTransferHandle {
    pub(crate) url: Option<String>,
    pub(crate) options: TransferOptions,
    pub(crate) write: Option<FfiWriteCallback>,
    pub(crate) write_data: *mut c_void,
}

impl FfiTransferHandle {
    pub(crate) fn new() -> Self {
        Self {
            url: None,
            options: TransferOptions::default(),
            write: None,
            write_data: std::ptr::null_mut(),
        }
    }
}

/// Status codes returned by setopt calls and carried in `FfiTransferResult`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    Ok = 0,
    NullArg = 1,
    UnknownOption = 2,
    /// The option exists but not with this value type, or the value is out
    /// of range.
    InvalidValue = 3,
    InvalidUrl = 4,
    Connect = 5,
    Io = 6,
    Parse = 7,
    TooManyRedirects = 8,
    Timeout = 9,
    Aborted = 10,
    Tls = 11,
    Panic = 12,
}

impl From<&TransferError> for FfiErrorCode {
    fn from(err: &TransferError) -> Self {
        if err.is_timeout() {
            return FfiErrorCode::Timeout;
        }
        match err {
            TransferError::InvalidUrl(_) => FfiErrorCode::InvalidUrl,
            TransferError::Connect(ConnectError::TlsHandshakeFailed(_)) => FfiErrorCode::Tls,
            TransferError::Connect(_) => FfiErrorCode::Connect,
            TransferError::Io(_) => FfiErrorCode::Io,
            TransferError::Parse(_) => FfiErrorCode::Parse,
            TransferError::TooManyRedirects { .. } => FfiErrorCode::TooManyRedirects,
            TransferError::Timeout => FfiErrorCode::Timeout,
            TransferError::Aborted => FfiErrorCode::Aborted,
            TransferError::TlsConfig(_) => FfiErrorCode::Tls,
        }
    }
}

/// Outcome of `transfer_perform`.
///
/// On success `error_code` is `Ok`, `error_message` is null, and the
/// remaining fields describe the final response. On failure `error_code`
/// describes the category, `error_message` is a human-readable C string,
/// the other pointers are null, and `bytes_delivered` still counts the body
/// bytes the write callback accepted before the failure.
#[repr(C)]
pub struct FfiTransferResult {
    pub error_code: FfiErrorCode,
    pub error_message: *mut c_char,
    pub http_status: u16,
    pub bytes_delivered: u64,
    pub redirects: u32,
    pub effective_url: *mut c_char,
    pub transfer_id: *mut c_char,
}

impl FfiTransferResult {
    pub(crate) fn ok(result: TransferResult) -> *mut Self {
        Box::into_raw(Box::new(FfiTransferResult {
            error_code: FfiErrorCode::Ok,
            error_message: std::ptr::null_mut(),
            http_status: result.status(),
            bytes_delivered: result.bytes_delivered,
            redirects: result.redirects,
            effective_url: c_string(result.effective_url.as_str()),
            transfer_id: c_string(&result.transfer_id.to_string()),
        }))
    }

    pub(crate) fn from_error(err: &TransferError) -> *mut Self {
        Self::failure(err.into(), &err.to_string())
    }

    pub(crate) fn failure(error_code: FfiErrorCode, msg: &str) -> *mut Self {
        Box::into_raw(Box::new(FfiTransferResult {
            error_code,
            error_message: c_string(msg),
            http_status: 0,
            bytes_delivered: 0,
            redirects: 0,
            effective_url: std::ptr::null_mut(),
            transfer_id: std::ptr::null_mut(),
        }))
    }

    /// Failure after `delivered` body bytes already reached the caller.
    pub(crate) fn from_partial(err: &TransferError, delivered: u64) -> *mut Self {
        let result = Self::from_error(err);
        unsafe { (*result).bytes_delivered = delivered };
        result
    }

    pub(crate) fn null_arg(name: &str) -> *mut Self {
        Self::failure(FfiErrorCode::NullArg, &format!("null argument: {name}"))
    }

    pub(crate) fn panic(msg: &str) -> *mut Self {
        Self::failure(FfiErrorCode::Panic, msg)
    }
}

/// One exported option constant.
#[repr(C)]
pub struct FfiConstant {
    /// Static, NUL-terminated. Never freed.
    pub name: *const c_char,
    pub value: u32,
}

/// Owned C string; interior NULs are stripped rather than failing.
pub(crate) fn c_string(s: &str) -> *mut c_char {
    let cleaned: Vec<u8> = s.bytes().filter(|&b| b != 0).collect();
    CString::new(cleaned).unwrap_or_default().into_raw()
}
