/*!
 * Server Limits and Constants
 *
 * Centralized location for table sizes, growth factors, and protocol constants.
 */

// =============================================================================
// HANDLE TABLES
// =============================================================================

/// Default per-process handle table capacity
pub const DEFAULT_MAX_HANDLES: usize = 16 * 1024;

/// Smallest handle table capacity a config may ask for
pub const MIN_MAX_HANDLES: usize = 4;

// =============================================================================
// REACTOR
// =============================================================================

/// Poll table size on first allocation
pub const POLL_TABLE_INITIAL: usize = 16;

/// Event batch size for epoll_wait/kevent
pub const POLL_EVENT_BATCH: usize = 128;

// =============================================================================
// DEVICE / INODE GRAPH
// =============================================================================

/// Buckets in the device table
pub const DEVICE_HASH_SIZE: usize = 7;

/// Buckets in each device's inode table
pub const INODE_HASH_SIZE: usize = 17;

/// Largest offset fcntl locks accept before the first EINVAL/EOVERFLOW
pub const MAX_UNIX_OFFSET: u64 = i64::MAX as u64;

/// Largest offset fcntl locks accept once the filesystem rejected 64-bit ranges
pub const MAX_UNIX_OFFSET_32: u64 = i32::MAX as u64;

/// Linux floppy block device major number
pub const FLOPPY_MAJOR: u64 = 2;

/// statfs magic numbers of removable media filesystems
pub const ISO9660_SUPER_MAGIC: i64 = 0x9660;
pub const SUPERMOUNT_SUPER_MAGIC: i64 = 0x9fa1;
pub const UDF_SUPER_MAGIC: i64 = 0x1501_3346;

// =============================================================================
// DEVICE CONTROL CODES
// =============================================================================

/// FSCTL_DISMOUNT_VOLUME
pub const FSCTL_DISMOUNT_VOLUME: u32 = 0x0009_0020;

// =============================================================================
// DEBUGGER
// =============================================================================

/// Maximum exception parameters carried by an exception event
pub const EXCEPTION_MAXIMUM_PARAMETERS: usize = 15;

/// Default reply capacity for variable-length reply data (64KB)
pub const DEFAULT_REPLY_MAX_SIZE: usize = 64 * 1024;

// =============================================================================
// MONITORING
// =============================================================================

/// Requests slower than this are logged at warn level
pub const DEFAULT_SLOW_REQUEST_MS: u64 = 10;
