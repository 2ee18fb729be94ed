/*!
 * Core Types
 * Common types used across the server
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID type
pub type ProcessId = u32;

/// Thread ID type
pub type ThreadId = u32;

/// Server time in 100ns ticks since server start
pub type Timestamp = i64;

/// Byte offset into a file
pub type FilePos = u64;

/// Opaque pointer-sized value in a client address space
pub type ClientPtr = u64;

/// Ticks per millisecond
pub const TICKS_PER_MS: Timestamp = 10_000;

/// Ticks per second
pub const TICKS_PER_SEC: Timestamp = 10_000_000;

/// Process-scoped handle to a kernel object
///
/// Values are multiples of 4; zero never names an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const NONE: Handle = Handle(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Loaded module as seen by the debugger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub base: ClientPtr,
    pub dbg_offset: u32,
    pub dbg_size: u32,
    pub name: ClientPtr,
}
