//! Option identifiers exported to embedding runtimes.
//!
//! The numeric ids match libcurl's `CURLOPT_*` values so bindings written
//! against curl's constant table can drive a transfer handle unchanged.

use std::ffi::CStr;

/// A transfer option a handle understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKey {
    Url,
    WriteFunction,
    WriteData,
    UserAgent,
    TimeoutMs,
    ConnectTimeoutMs,
    FollowLocation,
    MaxRedirs,
}

/// What kind of value a setopt call for a key must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    String,
    Long,
    Pointer,
    Callback,
}

/// One entry of the exported constant table.
#[derive(Debug, Clone, Copy)]
pub struct Constant {
    pub name: &'static CStr,
    pub value: u32,
    pub key: OptionKey,
}

pub const CONSTANTS: &[Constant] = &[
    Constant { name: c"CURLOPT_URL", value: 10002, key: OptionKey::Url },
    Constant { name: c"CURLOPT_WRITEFUNCTION", value: 20011, key: OptionKey::WriteFunction },
    Constant { name: c"CURLOPT_WRITEDATA", value: 10001, key: OptionKey::WriteData },
    Constant { name: c"CURLOPT_USERAGENT", value: 10018, key: OptionKey::UserAgent },
    Constant { name: c"CURLOPT_TIMEOUT_MS", value: 155, key: OptionKey::TimeoutMs },
    Constant { name: c"CURLOPT_CONNECTTIMEOUT_MS", value: 156, key: OptionKey::ConnectTimeoutMs },
    Constant { name: c"CURLOPT_FOLLOWLOCATION", value: 52, key: OptionKey::FollowLocation },
    Constant { name: c"CURLOPT_MAXREDIRS", value: 68, key: OptionKey::MaxRedirs },
];

impl OptionKey {
    pub fn from_id(id: u32) -> Option<Self> {
        CONSTANTS.iter().find(|c| c.value == id).map(|c| c.key)
    }

    pub fn kind(self) -> OptionKind {
        match self {
            OptionKey::Url | OptionKey::UserAgent => OptionKind::String,
            OptionKey::TimeoutMs
            | OptionKey::ConnectTimeoutMs
            | OptionKey::FollowLocation
            | OptionKey::MaxRedirs => OptionKind::Long,
            OptionKey::WriteData => OptionKind::Pointer,
            OptionKey::WriteFunction => OptionKind::Callback,
        }
    }
}

/// Find a constant by its exported name.
pub fn lookup(name: &str) -> Option<&'static Constant> {
    CONSTANTS
        .iter()
        .find(|c| c.name.to_str().is_ok_and(|n| n == name))
}
