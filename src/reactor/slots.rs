/*!
 * Slot Allocator
 *
 * Indexed free-list container with stable indices. Growth is about 1.5x,
 * starting from `POLL_TABLE_INITIAL`, and reports allocation failure instead
 * of aborting.
 */

use crate::core::errors::{ServerError, ServerResult};
use crate::core::limits::POLL_TABLE_INITIAL;

#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
    active: usize,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            active: 0,
        }
    }

    /// Capacity the table grows to when full
    pub fn next_capacity(current: usize) -> usize {
        if current == 0 {
            POLL_TABLE_INITIAL
        } else {
            current + current / 2
        }
    }

    pub fn insert(&mut self, value: T) -> ServerResult<usize> {
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(value);
                slot
            }
            None => {
                if self.slots.len() == self.slots.capacity() {
                    let target = Self::next_capacity(self.slots.capacity());
                    self.slots
                        .try_reserve_exact(target - self.slots.len())
                        .map_err(|_| ServerError::NoMemory("slot table growth".into()))?;
                    self.free
                        .try_reserve_exact(target.saturating_sub(self.free.len()))
                        .map_err(|_| ServerError::NoMemory("slot freelist growth".into()))?;
                }
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        };
        self.active += 1;
        Ok(slot)
    }

    pub fn remove(&mut self, slot: usize) -> Option<T> {
        let value = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.active -= 1;
        Some(value)
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.slots.get(slot)?.as_ref()
    }

    /// Number of occupied slots
    pub fn active(&self) -> usize {
        self.active
    }

    /// Highest slot index ever handed out, plus one
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
