//! # Intrusive List Entries for the Hand-Off ABI
//!
//! The hand-off block threads its nodes through `{flink, blink}` pairs
//! embedded in each record. The layout is part of the loader/kernel contract,
//! so this is a raw doubly-linked circular list rather than a safe container;
//! kernel-side collections that are not ABI use `intrusive-collections`
//! instead.
//!
//! A head is itself a [`ListEntry`] that links to itself when the list is
//! empty. All operations are O(1) pointer splices. Callers own node lifetime;
//! a node must be removed before its storage is reused.

use core::ptr;

/// A `{flink, blink}` pair embedded in every listed record.
#[repr(C)]
#[derive(Debug)]
pub struct ListEntry {
    pub flink: *mut ListEntry,
    pub blink: *mut ListEntry,
}

impl ListEntry {
    /// A detached entry; initialize heads with [`ListEntry::initialize_head`]
    /// before use.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            flink: ptr::null_mut(),
            blink: ptr::null_mut(),
        }
    }

    /// Makes `head` an empty list (both links pointing at itself).
    ///
    /// # Safety
    /// `head` must be valid for writes and must not currently be linked into
    /// a list anybody iterates.
    pub unsafe fn initialize_head(head: *mut Self) {
        unsafe {
            (*head).flink = head;
            (*head).blink = head;
        }
    }

    /// Whether the list at `head` is empty.
    ///
    /// # Safety
    /// `head` must be an initialized list head.
    #[must_use]
    pub unsafe fn is_empty(head: *const Self) -> bool {
        unsafe { (*head).flink.cast_const() == head }
    }

    /// Inserts `entry` directly after `head`.
    ///
    /// # Safety
    /// `head` must be an initialized head and `entry` a detached node, both
    /// valid for writes.
    pub unsafe fn insert_head(head: *mut Self, entry: *mut Self) {
        unsafe {
            let first = (*head).flink;
            (*entry).flink = first;
            (*entry).blink = head;
            (*first).blink = entry;
            (*head).flink = entry;
        }
    }

    /// Inserts `entry` directly before `head` (at the tail of the list).
    ///
    /// # Safety
    /// Same rules as [`ListEntry::insert_head`].
    pub unsafe fn insert_tail(head: *mut Self, entry: *mut Self) {
        unsafe {
            let last = (*head).blink;
            (*entry).flink = head;
            (*entry).blink = last;
            (*last).flink = entry;
            (*head).blink = entry;
        }
    }

    /// Unlinks `entry` from whatever list it is on.
    ///
    /// # Safety
    /// `entry` must currently be linked into a well-formed list.
    pub unsafe fn remove(entry: *mut Self) {
        unsafe {
            let flink = (*entry).flink;
            let blink = (*entry).blink;
            (*blink).flink = flink;
            (*flink).blink = blink;
            (*entry).flink = ptr::null_mut();
            (*entry).blink = ptr::null_mut();
        }
    }

    /// Iterates the entries of the list at `head` (head excluded).
    ///
    /// # Safety
    /// `head` must be an initialized head of a well-formed list that is not
    /// mutated while the iterator is alive.
    pub unsafe fn iter(head: *mut Self) -> ListIter {
        ListIter {
            head,
            current: unsafe { (*head).flink },
        }
    }
}

impl Default for ListEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward iterator over raw list entries.
#[derive(Debug)]
pub struct ListIter {
    head: *mut ListEntry,
    current: *mut ListEntry,
}

impl Iterator for ListIter {
    type Item = *mut ListEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == self.head {
            return None;
        }
        let entry = self.current;
        // SAFETY: the list is well-formed per `iter`'s contract.
        self.current = unsafe { (*entry).flink };
        Some(entry)
    }
}

/// Recovers a pointer to the record containing a [`ListEntry`].
///
/// `$entry` is the `*mut ListEntry`, `$record` the containing type, `$field`
/// the name of its embedded entry field.
#[macro_export]
macro_rules! containing_record {
    ($entry:expr, $record:ty, $field:ident) => {{
        let offset = core::mem::offset_of!($record, $field);
        $entry.cast::<u8>().sub(offset).cast::<$record>()
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Node {
        value: u32,
        entry: ListEntry,
    }

    impl Node {
        fn new(value: u32) -> Self {
            Self {
                value,
                entry: ListEntry::new(),
            }
        }
    }

    #[test]
    fn insert_remove_and_iterate() {
        let mut head = ListEntry::new();
        let mut a = Node::new(1);
        let mut b = Node::new(2);
        let mut c = Node::new(3);

        unsafe {
            ListEntry::initialize_head(&raw mut head);
            assert!(ListEntry::is_empty(&raw const head));

            ListEntry::insert_tail(&raw mut head, &raw mut a.entry);
            ListEntry::insert_tail(&raw mut head, &raw mut b.entry);
            ListEntry::insert_head(&raw mut head, &raw mut c.entry);

            let values: Vec<u32> = ListEntry::iter(&raw mut head)
                .map(|e| (*containing_record!(e, Node, entry)).value)
                .collect();
            assert_eq!(values, [3, 1, 2]);

            ListEntry::remove(&raw mut a.entry);
            let values: Vec<u32> = ListEntry::iter(&raw mut head)
                .map(|e| (*containing_record!(e, Node, entry)).value)
                .collect();
            assert_eq!(values, [3, 2]);

            ListEntry::remove(&raw mut c.entry);
            ListEntry::remove(&raw mut b.entry);
            assert!(ListEntry::is_empty(&raw const head));
        }
    }
}
