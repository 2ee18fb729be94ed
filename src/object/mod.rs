/*!
 * Object Model
 *
 * Every kernel-visible entity is an `Rc<T>` where `T: Object`. Cloning the
 * `Rc` is a grab, dropping it is a release, and the type's `Drop` impl is the
 * destroy hook, so destruction happens exactly once, when the last owning
 * reference goes away. Owning edges between objects are `Rc`; relational
 * links that must not keep their target alive are `Weak`.
 *
 * The `Object` trait is the per-type operation table. Its default methods are
 * the fallbacks for types that do not support an operation.
 */

pub mod completion;
pub mod event;
pub mod handle;
pub mod wait;

pub use completion::{Completion, CompletionMsg};
pub use event::Event;
pub use handle::{HandleTable, HandleTransaction};
pub use wait::{add_queue, remove_queue, wake_up, WaitEntry, WaitQueue};

use crate::core::errors::{ServerError, ServerResult};
use crate::core::flags::{Access, FileOptions, GenericMapping, ShareMode};
use crate::core::types::Handle;
use crate::fs::Fd;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::rc::Rc;

/// Kernel object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Fd,
    Device,
    Inode,
    FileLock,
    File,
    Stream,
    Async,
    Event,
    Completion,
    Process,
    Thread,
    DebugEvent,
    DebugCtx,
}

/// Upcast support for `Rc<dyn Object>` downcasting
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn into_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Operation table shared by all kernel objects
pub trait Object: AsAny {
    fn object_type(&self) -> ObjectType;

    /// One-line description for debug dumps
    fn dump(&self) -> String {
        format!("{:?}", self.object_type())
    }

    /// Queue of threads waiting on this object, if it is waitable
    fn wait_queue(&self) -> Option<&WaitQueue> {
        None
    }

    fn signaled(&self) -> bool {
        false
    }

    /// Called after a waiter consumed the signaled state
    fn satisfied(&self) {}

    fn signal(&self, _access: Access) -> ServerResult<()> {
        Err(ServerError::type_mismatch(format!(
            "{:?} cannot be signaled",
            self.object_type()
        )))
    }

    fn get_fd(&self) -> ServerResult<Rc<Fd>> {
        Err(ServerError::type_mismatch(format!(
            "{:?} has no file descriptor",
            self.object_type()
        )))
    }

    fn map_access(&self, access: Access) -> Access {
        access.map_generic(&GenericMapping::STANDARD)
    }

    fn security_descriptor(&self) -> Option<Vec<u8>> {
        None
    }

    fn set_security_descriptor(&self, _sd: &[u8]) -> ServerResult<()> {
        Err(ServerError::access_denied(format!(
            "{:?} has no security descriptor",
            self.object_type()
        )))
    }

    fn lookup_name(&self, name: &str) -> ServerResult<Rc<dyn Object>> {
        Err(ServerError::type_mismatch(format!(
            "{:?} has no namespace to look up {}",
            self.object_type(),
            name
        )))
    }

    fn open_file(
        &self,
        _access: Access,
        _sharing: ShareMode,
        _options: FileOptions,
    ) -> ServerResult<Rc<dyn Object>> {
        Err(ServerError::type_mismatch(format!(
            "{:?} cannot be opened as a file",
            self.object_type()
        )))
    }

    /// Veto hook run before a handle to this object is closed
    fn close_handle(&self, _handle: Handle) -> bool {
        true
    }
}

/// Take another owning reference
#[inline]
pub fn grab<T: ?Sized>(obj: &Rc<T>) -> Rc<T> {
    Rc::clone(obj)
}

/// Drop an owning reference; the last one runs the destroy hook
#[inline]
pub fn release<T: ?Sized>(obj: Rc<T>) {
    drop(obj)
}

/// Recover the concrete type behind a trait object
pub fn downcast<T: Object>(obj: Rc<dyn Object>) -> ServerResult<Rc<T>> {
    let kind = obj.object_type();
    obj.into_any_rc().downcast::<T>().map_err(|_| {
        ServerError::type_mismatch(format!(
            "expected {}, found {:?}",
            std::any::type_name::<T>(),
            kind
        ))
    })
}
