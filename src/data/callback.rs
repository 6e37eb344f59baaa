// MIT License - Copyright (c) 2026 zway-core contributors
// Change notifications for data holders

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;

use crate::data::tree::{DataTree, HolderId};

/// What happened to a data holder. Mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChangeKind {
    /// Value updated
    Updated = 0x01,
    /// Value invalidated
    Invalidated = 0x02,
    /// Holder deleted; the last notification it receives
    Deleted = 0x03,
    /// New direct child created
    ChildCreated = 0x04,
}

bitflags! {
    /// Modifiers OR'd onto a [`ChangeKind`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChangeFlags: u8 {
        /// Updated with the same value; only the update time moved
        const PHANTOM_UPDATE = 0x40;
        /// Event bubbled from a descendant
        const CHILD_EVENT    = 0x80;
    }
}

/// A change notification as delivered to callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataChange {
    pub kind: ChangeKind,
    pub flags: ChangeFlags,
}

impl DataChange {
    pub fn new(kind: ChangeKind) -> Self {
        Self { kind, flags: ChangeFlags::empty() }
    }

    pub(crate) fn phantom(mut self) -> Self {
        self.flags |= ChangeFlags::PHANTOM_UPDATE;
        self
    }

    pub(crate) fn bubbled(mut self) -> Self {
        self.flags |= ChangeFlags::CHILD_EVENT;
        self
    }

    pub fn is_phantom(&self) -> bool {
        self.flags.contains(ChangeFlags::PHANTOM_UPDATE)
    }

    pub fn is_child_event(&self) -> bool {
        self.flags.contains(ChangeFlags::CHILD_EVENT)
    }

    /// Combined integer form (kind | flags).
    pub fn bits(&self) -> u8 {
        self.kind as u8 | self.flags.bits()
    }
}

/// Opaque argument handed back to a callback on every invocation.
///
/// Two arguments are the same when they share the same allocation (or are
/// both absent); the payload itself is never compared.
#[derive(Clone, Default)]
pub struct CallbackArg(Option<Arc<dyn Any + Send + Sync>>);

impl CallbackArg {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref::<T>())
    }

    pub fn same_as(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for CallbackArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(a) => write!(f, "CallbackArg({:p})", Arc::as_ptr(a)),
            None => write!(f, "CallbackArg(none)"),
        }
    }
}

/// Receiver of data holder change notifications.
///
/// Called synchronously with the tree lock held. Implementations may read
/// and write the tree (the lock is re-entrant) but must not block waiting on
/// another thread that needs the lock.
pub trait DataCallback: Send + Sync {
    fn on_change(&self, tree: &DataTree, change: DataChange, holder: HolderId, arg: &CallbackArg);
}

impl<F> DataCallback for F
where
    F: Fn(&DataTree, DataChange, HolderId, &CallbackArg) + Send + Sync,
{
    fn on_change(&self, tree: &DataTree, change: DataChange, holder: HolderId, arg: &CallbackArg) {
        self(tree, change, holder, arg)
    }
}

/// Shared handle to a data callback. Identity is the allocation.
pub type DataCallbackRef = Arc<dyn DataCallback>;

/// Wrap a closure as a [`DataCallbackRef`].
pub fn data_callback<F>(f: F) -> DataCallbackRef
where
    F: Fn(&DataTree, DataChange, HolderId, &CallbackArg) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn same_callback<C: ?Sized>(a: &Arc<C>, b: &Arc<C>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) struct CallbackEntry<C: ?Sized, M> {
    pub callback: Arc<C>,
    pub arg: CallbackArg,
    pub meta: M,
}

/// Ordered callback list with the two duplicate-suppression modes.
///
/// `M` is per-entry metadata: the watch-children flag for data holders,
/// the event mask for device callbacks.
pub(crate) struct CallbackList<C: ?Sized, M> {
    entries: Vec<CallbackEntry<C, M>>,
}

impl<C: ?Sized, M: Copy> CallbackList<C, M> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Add unless the same callback is already registered (any argument).
    pub fn add(&mut self, callback: Arc<C>, meta: M, arg: CallbackArg) -> bool {
        if self.entries.iter().any(|e| same_callback(&e.callback, &callback)) {
            return false;
        }
        self.entries.push(CallbackEntry { callback, arg, meta });
        true
    }

    /// Add unless the same (callback, argument) pair is already registered.
    pub fn add_ex(&mut self, callback: Arc<C>, meta: M, arg: CallbackArg) -> bool {
        if self
            .entries
            .iter()
            .any(|e| same_callback(&e.callback, &callback) && e.arg.same_as(&arg))
        {
            return false;
        }
        self.entries.push(CallbackEntry { callback, arg, meta });
        true
    }

    /// Remove every entry of the callback. Returns how many were removed.
    pub fn remove(&mut self, callback: &Arc<C>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !same_callback(&e.callback, callback));
        before - self.entries.len()
    }

    /// Remove the first entry matching the (callback, argument) pair.
    pub fn remove_ex(&mut self, callback: &Arc<C>, arg: &CallbackArg) -> bool {
        match self
            .entries
            .iter()
            .position(|e| same_callback(&e.callback, callback) && e.arg.same_as(arg))
        {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Snapshot of entries whose metadata passes `filter`, in registration order.
    pub fn snapshot(&self, filter: impl Fn(M) -> bool) -> Vec<(Arc<C>, CallbackArg, M)> {
        self.entries
            .iter()
            .filter(|e| filter(e.meta))
            .map(|e| (e.callback.clone(), e.arg.clone(), e.meta))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Callback list attached to a data holder; metadata is `watch_children`.
pub(crate) type DataCallbackList = CallbackList<dyn DataCallback, bool>;
