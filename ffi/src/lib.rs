//! C-ABI wrapper around `transfer-core`.
//!
//! # Overview
//! Exposes a curl-style easy interface through `extern "C"` functions: create
//! a handle, set options by numeric id, perform the transfer, free the result.
//! The option ids and the constant table let a scripting runtime bind to the
//! engine the same way it would bind to libcurl.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - setopt calls return an `FfiErrorCode` by value; `transfer_perform`
//!   returns a heap-allocated `FfiTransferResult` envelope.
//! - The body is streamed to the handle's write callback as it arrives. With
//!   no callback set it goes to stdout.
//! - The C caller owns all returned pointers and must call the matching
//!   `transfer_free_*` function to release them.

pub mod constants;
pub mod types;

use std::ffi::{c_void, CStr, CString};
use std::io::Write;
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

use transfer_core::{BodyFrame, SinkFlow, TransferEngine};

use constants::{OptionKey, OptionKind, CONSTANTS};
use types::*;

// ---------------------------------------------------------------------------
// Handle lifecycle
// ---------------------------------------------------------------------------

/// Create a transfer handle with default options.
///
/// The caller must free the returned pointer with `transfer_handle_free`.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_handle_new() -> *mut FfiTransferHandle {
    catch_unwind(|| Box::into_raw(Box::new(FfiTransferHandle::new())))
        .unwrap_or(std::ptr::null_mut())
}

/// Free a handle created by `transfer_handle_new`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_handle_free(handle: *mut FfiTransferHandle) {
    if !handle.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { Box::from_raw(handle) });
        });
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Set a string option (`CURLOPT_URL`, `CURLOPT_USERAGENT`). The string is
/// copied. A null `CURLOPT_USERAGENT` removes the User-Agent header.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_setopt_string(
    handle: *mut FfiTransferHandle,
    option: u32,
    value: *const c_char,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = (unsafe { handle.as_mut() }) else {
            return FfiErrorCode::NullArg;
        };
        let key = match expect_kind(option, OptionKind::String) {
            Ok(key) => key,
            Err(code) => return code,
        };
        let value = if value.is_null() {
            None
        } else {
            match unsafe { CStr::from_ptr(value) }.to_str() {
                Ok(s) => Some(s.to_string()),
                Err(_) => return FfiErrorCode::InvalidValue,
            }
        };
        match key {
            OptionKey::Url => match value {
                Some(url) => handle.url = Some(url),
                None => return FfiErrorCode::NullArg,
            },
            OptionKey::UserAgent => handle.options.user_agent = value,
            _ => return FfiErrorCode::InvalidValue,
        }
        FfiErrorCode::Ok
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Set an integer option (`CURLOPT_TIMEOUT_MS`, `CURLOPT_CONNECTTIMEOUT_MS`,
/// `CURLOPT_FOLLOWLOCATION`, `CURLOPT_MAXREDIRS`).
///
/// Timeouts of 0 disable the limit. `CURLOPT_MAXREDIRS` counts redirects
/// followed, as in curl; -1 removes the cap, though cycles are still
/// detected.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_setopt_long(
    handle: *mut FfiTransferHandle,
    option: u32,
    value: i64,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = (unsafe { handle.as_mut() }) else {
            return FfiErrorCode::NullArg;
        };
        let key = match expect_kind(option, OptionKind::Long) {
            Ok(key) => key,
            Err(code) => return code,
        };
        let options = &mut handle.options;
        match key {
            OptionKey::TimeoutMs | OptionKey::ConnectTimeoutMs => {
                let Ok(ms) = u64::try_from(value) else {
                    return FfiErrorCode::InvalidValue;
                };
                if key == OptionKey::TimeoutMs {
                    options.total_timeout_ms = ms;
                } else {
                    options.connect_timeout_ms = ms;
                }
            }
            OptionKey::FollowLocation => options.follow_redirects = value != 0,
            // The engine caps requests per chain; curl counts redirects.
            OptionKey::MaxRedirs => {
                options.max_redirects = match value {
                    -1 => u32::MAX,
                    v => match u32::try_from(v) {
                        Ok(v) => v.saturating_add(1),
                        Err(_) => return FfiErrorCode::InvalidValue,
                    },
                };
            }
            _ => return FfiErrorCode::InvalidValue,
        }
        FfiErrorCode::Ok
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Set a pointer option. Only `CURLOPT_WRITEDATA` is accepted: the pointer
/// is handed back verbatim to the write callback.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_setopt_pointer(
    handle: *mut FfiTransferHandle,
    option: u32,
    value: *mut c_void,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = (unsafe { handle.as_mut() }) else {
            return FfiErrorCode::NullArg;
        };
        match expect_kind(option, OptionKind::Pointer) {
            Ok(_) => {
                handle.write_data = value;
                FfiErrorCode::Ok
            }
            Err(code) => code,
        }
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

/// Set `CURLOPT_WRITEFUNCTION`. A null callback restores the stdout default.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_setopt_write_callback(
    handle: *mut FfiTransferHandle,
    callback: Option<FfiWriteCallback>,
) -> FfiErrorCode {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = (unsafe { handle.as_mut() }) else {
            return FfiErrorCode::NullArg;
        };
        handle.write = callback;
        FfiErrorCode::Ok
    }))
    .unwrap_or(FfiErrorCode::Panic)
}

fn expect_kind(option: u32, kind: OptionKind) -> Result<OptionKey, FfiErrorCode> {
    let key = OptionKey::from_id(option).ok_or(FfiErrorCode::UnknownOption)?;
    if key.kind() != kind {
        return Err(FfiErrorCode::InvalidValue);
    }
    Ok(key)
}

// ---------------------------------------------------------------------------
// Perform
// ---------------------------------------------------------------------------

/// Run the transfer configured on `handle`, blocking until it completes.
///
/// The handle can be performed again; each call opens a fresh connection.
/// The caller must free the returned pointer with `transfer_free_result`.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_perform(handle: *const FfiTransferHandle) -> *mut FfiTransferResult {
    catch_unwind(AssertUnwindSafe(|| {
        let Some(handle) = (unsafe { handle.as_ref() }) else {
            return FfiTransferResult::null_arg("handle");
        };
        let Some(url) = handle.url.as_deref() else {
            return FfiTransferResult::failure(FfiErrorCode::InvalidUrl, "no URL set");
        };
        let engine = match TransferEngine::new() {
            Ok(engine) => engine,
            Err(err) => return FfiTransferResult::from_error(&err),
        };

        let mut delivered: u64 = 0;
        let outcome = match handle.write {
            Some(callback) => {
                let user_data = handle.write_data;
                let mut sink = |frame: &BodyFrame| match frame {
                    BodyFrame::Chunk(bytes) => {
                        if callback(bytes.as_ptr(), bytes.len(), user_data) == bytes.len() {
                            delivered += bytes.len() as u64;
                            SinkFlow::Continue
                        } else {
                            SinkFlow::Abort
                        }
                    }
                    _ => SinkFlow::Continue,
                };
                engine.fetch(url, &mut sink, &handle.options)
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                let mut sink = |frame: &BodyFrame| match frame {
                    BodyFrame::Chunk(bytes) => match stdout.write_all(bytes) {
                        Ok(()) => {
                            delivered += bytes.len() as u64;
                            SinkFlow::Continue
                        }
                        Err(_) => SinkFlow::Abort,
                    },
                    _ => SinkFlow::Continue,
                };
                engine.fetch(url, &mut sink, &handle.options)
            }
        };

        match outcome {
            Ok(result) => FfiTransferResult::ok(result),
            Err(err) => FfiTransferResult::from_partial(&err, delivered),
        }
    }))
    .unwrap_or_else(|_| FfiTransferResult::panic("panic in transfer_perform"))
}

// ---------------------------------------------------------------------------
// Constant table
// ---------------------------------------------------------------------------

/// Number of exported option constants.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_constant_count() -> u32 {
    CONSTANTS.len() as u32
}

/// Constant at `index`, or `{NULL, 0}` when out of range. The name is a
/// static string and must not be freed.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_constant_at(index: u32) -> FfiConstant {
    match CONSTANTS.get(index as usize) {
        Some(c) => FfiConstant {
            name: c.name.as_ptr(),
            value: c.value,
        },
        None => FfiConstant {
            name: std::ptr::null(),
            value: 0,
        },
    }
}

/// Look up a constant by name. Returns `false` and leaves `out` untouched
/// when the name is unknown or an argument is null.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_lookup_constant(name: *const c_char, out: *mut u32) -> bool {
    catch_unwind(|| {
        if name.is_null() || out.is_null() {
            return false;
        }
        let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
            return false;
        };
        match constants::lookup(name) {
            Some(c) => {
                unsafe { *out = c.value };
                true
            }
            None => false,
        }
    })
    .unwrap_or(false)
}

/// Call `callback(name, value, user_data)` once per exported constant, in
/// table order. This is the registration hook a runtime uses to define the
/// `CURLOPT_*` names.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_bundle_constants(
    callback: Option<FfiConstantCallback>,
    user_data: *mut c_void,
) {
    let Some(callback) = callback else {
        return;
    };
    let _ = catch_unwind(AssertUnwindSafe(|| {
        for c in CONSTANTS {
            callback(c.name.as_ptr(), c.value, user_data);
        }
    }));
}

// ---------------------------------------------------------------------------
// Free functions
// ---------------------------------------------------------------------------

/// Free an `FfiTransferResult` returned by `transfer_perform`. Safe to call
/// with null.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_free_result(result: *mut FfiTransferResult) {
    if result.is_null() {
        return;
    }
    let _ = catch_unwind(|| {
        let result = unsafe { Box::from_raw(result) };
        for s in [result.error_message, result.effective_url, result.transfer_id] {
            if !s.is_null() {
                drop(unsafe { CString::from_raw(s) });
            }
        }
    });
}

/// Free a C string allocated by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn transfer_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { CString::from_raw(s) });
        });
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
