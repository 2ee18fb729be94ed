/*!
 * Opening Fds
 *
 * Path opens attach regular files and directories to their inode and run
 * the sharing check against every other open of that inode. Special files
 * skip inode tracking. Anonymous fds wrap a descriptor the server already
 * holds; pseudo-fds have no descriptor at all.
 */

use super::device::FileRegistry;
use super::fd::{Fd, FdOps, FdParams};
use super::inode::Inode;
use crate::core::errors::{ServerError, ServerResult, Status};
use crate::core::flags::{Access, CreateFlags, FileOptions, GenericMapping, ShareMode};
use nix::errno::Errno;
use nix::libc;
use serde::{Deserialize, Serialize};
use std::fs::{DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::Path;
use std::rc::Rc;
use tracing::debug;

/// Parameters of a path open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenParams {
    #[serde(with = "crate::core::flags::create_flags_bits")]
    pub flags: CreateFlags,
    /// Permission bits for a created file
    pub mode: u32,
    #[serde(with = "crate::core::flags::access_bits")]
    pub access: Access,
    #[serde(with = "crate::core::flags::share_bits")]
    pub sharing: ShareMode,
    #[serde(with = "crate::core::flags::options_bits")]
    pub options: FileOptions,
}

impl Default for OpenParams {
    fn default() -> Self {
        Self {
            flags: CreateFlags::empty(),
            mode: 0o666,
            access: Access::READ_DATA,
            sharing: ShareMode::all(),
            options: FileOptions::empty(),
        }
    }
}

/// Check a new open of `inode` against the opens already there
///
/// Existing opens contribute the union of their access and the intersection
/// of their share modes; an open with no access takes no part. Read, write
/// and delete are checked independently, in both directions.
pub fn check_sharing(
    inode: &Inode,
    exclude: Option<&Fd>,
    access: Access,
    sharing: ShareMode,
) -> ServerResult<()> {
    let mut existing_sharing = ShareMode::all();
    let mut existing_access = Access::empty();
    for other in inode.open_fds() {
        if exclude.map_or(false, |fd| std::ptr::eq(fd, other.as_ref())) {
            continue;
        }
        if !other.access().is_empty() {
            existing_sharing &= other.sharing();
        }
        existing_access |= other.access();
    }

    if access.is_empty() {
        return Ok(());
    }
    let forbids = |rights: Access, share: ShareMode| {
        (rights.intersects(Access::UNIX_READ) && !share.contains(ShareMode::READ))
            || (rights.intersects(Access::UNIX_WRITE) && !share.contains(ShareMode::WRITE))
            || (rights.contains(Access::DELETE) && !share.contains(ShareMode::DELETE))
    };
    if forbids(access, existing_sharing) {
        return Err(ServerError::SharingViolation(format!(
            "requested access {:#x} not shared by existing opens",
            access.bits()
        )));
    }
    if forbids(existing_access, sharing) {
        return Err(ServerError::SharingViolation(format!(
            "existing access {:#x} not allowed by requested share mode",
            existing_access.bits()
        )));
    }
    Ok(())
}

fn open_unix(
    path: &Path,
    flags: CreateFlags,
    mode: u32,
    read: bool,
    write: bool,
) -> io::Result<std::fs::File> {
    let mut custom = 0;
    if flags.contains(CreateFlags::CREATE) {
        custom |= libc::O_CREAT;
    }
    if flags.contains(CreateFlags::EXCL) {
        custom |= libc::O_EXCL;
    }
    OpenOptions::new()
        .read(read || !write)
        .write(write)
        .custom_flags(custom)
        .mode(mode)
        .open(path)
}

/// Open `path` and wrap it in an Fd driven by `ops`
pub fn open_fd(
    registry: &Rc<FileRegistry>,
    path: &Path,
    params: &OpenParams,
    ops: Box<dyn FdOps>,
) -> ServerResult<Rc<Fd>> {
    let access = params.access.map_generic(&GenericMapping::FILE);
    let options = params.options;
    let mut flags = params.flags;

    if options.contains(FileOptions::DELETE_ON_CLOSE) && !access.contains(Access::DELETE) {
        return Err(Status::CANNOT_DELETE.into());
    }

    if options.contains(FileOptions::DIRECTORY_FILE) && flags.contains(CreateFlags::CREATE) {
        match DirBuilder::new().mode(0o777).create(path) {
            Ok(()) => {}
            Err(e)
                if e.kind() == io::ErrorKind::AlreadyExists
                    && !flags.contains(CreateFlags::EXCL) => {}
            Err(e) => return Err(e.into()),
        }
        flags.remove(CreateFlags::CREATE | CreateFlags::EXCL | CreateFlags::TRUNC);
    }

    let read = access.intersects(Access::UNIX_READ);
    let write =
        access.intersects(Access::UNIX_WRITE) && !options.contains(FileOptions::DIRECTORY_FILE);
    let file = match open_unix(path, flags, params.mode, read, write) {
        Ok(file) => file,
        // a directory asked for write access is reopened read-only
        Err(e) if e.raw_os_error() == Some(libc::EISDIR) && write => {
            open_unix(path, flags, params.mode, true, false)?
        }
        Err(e) => return Err(e.into()),
    };

    let meta = file.metadata()?;
    let file_type = meta.file_type();
    let unix_fd: OwnedFd = file.into();

    if !(file_type.is_file() || file_type.is_dir()) {
        if options.contains(FileOptions::DIRECTORY_FILE) {
            return Err(ServerError::NotADirectory(path.display().to_string()));
        }
        if options.contains(FileOptions::DELETE_ON_CLOSE) {
            return Err(ServerError::invalid_parameter(
                "special files cannot be deleted on close",
            ));
        }
        debug!(path = %path.display(), "special file opened without inode");
        return Fd::new(
            registry,
            ops,
            FdParams {
                unix_fd: Some(unix_fd),
                inode: None,
                access,
                sharing: params.sharing,
                options,
            },
        );
    }

    let inode = registry.get_inode(meta.dev(), meta.ino(), Some(unix_fd.as_raw_fd()));
    let fd = Fd::new(
        registry,
        ops,
        FdParams {
            unix_fd: Some(unix_fd),
            inode: Some(Rc::clone(&inode)),
            access,
            sharing: params.sharing,
            options,
        },
    )?;

    // failures from here on drop the fd, which parks the descriptor on the inode
    if options.contains(FileOptions::DIRECTORY_FILE) && !file_type.is_dir() {
        return Err(ServerError::NotADirectory(path.display().to_string()));
    }
    if options.contains(FileOptions::NON_DIRECTORY_FILE) && file_type.is_dir() {
        return Err(ServerError::IsADirectory(path.display().to_string()));
    }
    check_sharing(&inode, Some(&fd), access, params.sharing)?;

    if options.contains(FileOptions::DELETE_ON_CLOSE) {
        fd.set_unlink_path(Some(path.to_path_buf()));
    }
    if flags.contains(CreateFlags::TRUNC) {
        let unix_fd = fd.get_unix_fd()?;
        // SAFETY: unix_fd is owned by fd, which is alive for the call
        Errno::result(unsafe { libc::ftruncate(unix_fd, 0) })?;
    }
    debug!(
        path = %path.display(),
        dev = meta.dev(),
        ino = meta.ino(),
        access = access.bits(),
        sharing = params.sharing.bits(),
        "file opened"
    );
    Ok(fd)
}

/// Wrap a descriptor the server already owns; no inode, no sharing checks
pub fn create_anonymous_fd(
    registry: &Rc<FileRegistry>,
    ops: Box<dyn FdOps>,
    unix_fd: OwnedFd,
    options: FileOptions,
) -> ServerResult<Rc<Fd>> {
    Fd::new(
        registry,
        ops,
        FdParams {
            unix_fd: Some(unix_fd),
            inode: None,
            access: Access::empty(),
            sharing: ShareMode::all(),
            options,
        },
    )
}

/// Fd for objects that want async queues without a descriptor
pub fn alloc_pseudo_fd(
    registry: &Rc<FileRegistry>,
    ops: Box<dyn FdOps>,
    options: FileOptions,
) -> Rc<Fd> {
    Fd::unpolled(
        registry,
        ops,
        FdParams {
            unix_fd: None,
            inode: None,
            access: Access::empty(),
            sharing: ShareMode::all(),
            options,
        },
    )
}
