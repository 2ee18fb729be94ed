/*!
 * Handle Tables
 *
 * Per-process map from handle value to (object, granted access). Handle
 * values are `(index + 1) * 4`, so zero is never a valid handle. Closed
 * objects are released only after the table borrow ends, because a release
 * may run a destroy hook that touches another handle table.
 */

use super::{downcast, Object};
use crate::core::errors::{ServerError, ServerResult};
use crate::core::flags::Access;
use crate::core::types::Handle;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use tracing::debug;

struct HandleEntry {
    object: Rc<dyn Object>,
    access: Access,
}

pub struct HandleTable {
    entries: RefCell<Vec<Option<HandleEntry>>>,
    free: RefCell<Vec<usize>>,
    count: Cell<usize>,
    limit: usize,
}

impl HandleTable {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            count: Cell::new(0),
            limit,
        }
    }

    fn index_of(handle: Handle) -> Option<usize> {
        if handle.0 == 0 || handle.0 % 4 != 0 {
            return None;
        }
        Some((handle.0 / 4) as usize - 1)
    }

    fn handle_of(index: usize) -> Handle {
        Handle(((index + 1) * 4) as u32)
    }

    /// Store a new owning reference; `access` is mapped through the object's generic mapping
    pub fn alloc(&self, object: Rc<dyn Object>, access: Access) -> ServerResult<Handle> {
        if self.count.get() >= self.limit {
            return Err(ServerError::NoMemory(format!(
                "handle table full ({} entries)",
                self.limit
            )));
        }
        let access = object.map_access(access);
        let entry = HandleEntry { object, access };
        let mut entries = self.entries.borrow_mut();
        let index = match self.free.borrow_mut().pop() {
            Some(index) => {
                entries[index] = Some(entry);
                index
            }
            None => {
                entries
                    .try_reserve(1)
                    .map_err(|_| ServerError::NoMemory("handle table growth".into()))?;
                entries.push(Some(entry));
                entries.len() - 1
            }
        };
        self.count.set(self.count.get() + 1);
        Ok(Self::handle_of(index))
    }

    /// Look up a handle, requiring every right in `access`
    pub fn get(&self, handle: Handle, access: Access) -> ServerResult<Rc<dyn Object>> {
        let entries = self.entries.borrow();
        let entry = Self::index_of(handle)
            .and_then(|index| entries.get(index))
            .and_then(Option::as_ref)
            .ok_or(ServerError::InvalidHandle(handle.0))?;
        if !entry.access.contains(access) {
            return Err(ServerError::access_denied(format!(
                "handle {} grants {:?}, needs {:?}",
                handle, entry.access, access
            )));
        }
        Ok(Rc::clone(&entry.object))
    }

    /// Look up a handle and downcast it to a concrete object type
    pub fn get_typed<T: Object>(&self, handle: Handle, access: Access) -> ServerResult<Rc<T>> {
        downcast::<T>(self.get(handle, access)?)
    }

    pub fn access(&self, handle: Handle) -> ServerResult<Access> {
        let entries = self.entries.borrow();
        Self::index_of(handle)
            .and_then(|index| entries.get(index))
            .and_then(Option::as_ref)
            .map(|entry| entry.access)
            .ok_or(ServerError::InvalidHandle(handle.0))
    }

    pub fn close(&self, handle: Handle) -> ServerResult<()> {
        let object = self.get(handle, Access::empty())?;
        if !object.close_handle(handle) {
            return Err(ServerError::NotClosable);
        }
        let removed = self.take(handle);
        drop(object);
        drop(removed);
        Ok(())
    }

    fn take(&self, handle: Handle) -> Option<HandleEntry> {
        let index = Self::index_of(handle)?;
        let removed = self.entries.borrow_mut().get_mut(index)?.take();
        if removed.is_some() {
            self.free.borrow_mut().push(index);
            self.count.set(self.count.get() - 1);
        }
        removed
    }

    /// Close every handle, as on process exit
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.borrow_mut());
        self.free.borrow_mut().clear();
        let closed = self.count.replace(0);
        debug!(closed, "handle table cleared");
        drop(entries);
    }

    pub fn len(&self) -> usize {
        self.count.get()
    }

    pub fn is_empty(&self) -> bool {
        self.count.get() == 0
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Handles allocated as one unit: all of them survive, or none do
///
/// Uncommitted handles are closed when the transaction drops.
pub struct HandleTransaction<'a> {
    table: &'a HandleTable,
    handles: Vec<Handle>,
}

impl<'a> HandleTransaction<'a> {
    pub fn new(table: &'a HandleTable) -> Self {
        Self {
            table,
            handles: Vec::new(),
        }
    }

    pub fn alloc(&mut self, object: Rc<dyn Object>, access: Access) -> ServerResult<Handle> {
        let handle = self.table.alloc(object, access)?;
        self.handles.push(handle);
        Ok(handle)
    }

    pub fn commit(mut self) {
        self.handles.clear();
    }
}

impl Drop for HandleTransaction<'_> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..).rev() {
            drop(self.table.take(handle));
        }
    }
}
