// MIT License - Copyright (c) 2026 zway-core contributors
// Hierarchical observable data store

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use serde_json::json;
use tracing::{debug, trace};

use crate::data::callback::{CallbackArg, ChangeKind, DataCallbackList, DataCallbackRef, DataChange};
use crate::data::value::{DataType, DataValue};
use crate::error::{Result, ZWayError, internal_error};

/// Handle to a data holder. Stays valid until the holder is removed;
/// identifiers are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HolderId(u64);

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Holder {
    name: String,
    value: DataValue,
    update_time: Option<DateTime<Utc>>,
    invalidate_time: Option<DateTime<Utc>>,
    read_only: bool,
    parent: Option<HolderId>,
    children: Vec<HolderId>,
    callbacks: DataCallbackList,
}

impl Holder {
    fn new(name: String, parent: Option<HolderId>) -> Self {
        Self {
            name,
            value: DataValue::Empty,
            update_time: None,
            invalidate_time: None,
            read_only: false,
            parent,
            children: Vec::new(),
            callbacks: DataCallbackList::new(),
        }
    }
}

struct TreeState {
    holders: HashMap<HolderId, Holder>,
    next_id: u64,
    last_stamp: DateTime<Utc>,
}

impl TreeState {
    fn holder(&self, id: HolderId) -> Result<&Holder> {
        self.holders
            .get(&id)
            .ok_or_else(|| ZWayError::invalid_arg(format!("data holder {} does not exist", id)))
    }

    fn holder_mut(&mut self, id: HolderId) -> Result<&mut Holder> {
        self.holders
            .get_mut(&id)
            .ok_or_else(|| ZWayError::invalid_arg(format!("data holder {} does not exist", id)))
    }

    /// Strictly increasing timestamps, even when the wall clock stalls.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let t = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + TimeDelta::microseconds(1)
        };
        self.last_stamp = t;
        t
    }

    fn child_named(&self, parent: HolderId, name: &str) -> Result<Option<HolderId>> {
        let holder = self.holder(parent)?;
        Ok(holder
            .children
            .iter()
            .copied()
            .find(|c| self.holders.get(c).is_some_and(|h| h.name == name)))
    }

    fn insert_child(&mut self, parent: HolderId, name: &str) -> Result<HolderId> {
        self.holder(parent)?;
        let id = HolderId(self.next_id);
        self.next_id += 1;
        self.holders.insert(id, Holder::new(name.to_string(), Some(parent)));
        self.holder_mut(parent)?.children.push(id);
        Ok(id)
    }

    fn ancestors(&self, id: HolderId) -> Vec<HolderId> {
        let mut out = Vec::new();
        let mut cur = self.holders.get(&id).and_then(|h| h.parent);
        while let Some(p) = cur {
            out.push(p);
            cur = self.holders.get(&p).and_then(|h| h.parent);
        }
        out
    }

    fn subtree_post_order(&self, id: HolderId, out: &mut Vec<HolderId>) {
        if let Some(h) = self.holders.get(&id) {
            for c in &h.children {
                self.subtree_post_order(*c, out);
            }
            out.push(id);
        }
    }

    fn subtree_pre_order(&self, id: HolderId, out: &mut Vec<HolderId>) {
        if let Some(h) = self.holders.get(&id) {
            out.push(id);
            for c in &h.children {
                self.subtree_pre_order(*c, out);
            }
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(ZWayError::invalid_arg(format!("malformed data path '{}'", path)));
    }
    Ok(segments)
}

/// Guard returned by [`DataTree::lock`]. The tree stays locked for other
/// threads until it is dropped; the owning thread may keep calling tree
/// methods.
pub struct DataLock<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<TreeState>>,
}

type Pending = Vec<(DataCallbackRef, CallbackArg, DataChange)>;

/// Tree of named, typed, observable data holders.
///
/// Every operation takes the tree's re-entrant lock for its duration.
/// Change notifications are delivered synchronously, with the lock held,
/// before the mutating call returns.
pub struct DataTree {
    root: HolderId,
    state: ReentrantMutex<RefCell<TreeState>>,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTree {
    pub fn new() -> Self {
        let root = HolderId(0);
        let mut holders = HashMap::new();
        holders.insert(root, Holder::new(String::new(), None));
        Self {
            root,
            state: ReentrantMutex::new(RefCell::new(TreeState {
                holders,
                next_id: 1,
                last_stamp: DateTime::<Utc>::MIN_UTC,
            })),
        }
    }

    pub fn root(&self) -> HolderId {
        self.root
    }

    /// Hold the tree lock across several operations.
    pub fn lock(&self) -> DataLock<'_> {
        DataLock { _guard: self.state.lock() }
    }

    fn read<R>(&self, f: impl FnOnce(&TreeState) -> Result<R>) -> Result<R> {
        let guard = self.state.lock();
        let state = guard.borrow();
        f(&state)
    }

    fn write<R>(&self, f: impl FnOnce(&mut TreeState) -> Result<R>) -> Result<R> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    // --- Navigation ---

    /// Resolve a dotted path below `from`, creating missing segments.
    ///
    /// An empty path resolves to `from` itself. Fails only for a path with
    /// an empty segment or a `from` holder that no longer exists.
    pub fn find(&self, from: HolderId, path: &str) -> Result<HolderId> {
        let segments = split_path(path)?;
        let _guard = self.state.lock();
        let mut cur = from;
        self.read(|s| s.holder(from).map(|_| ()))?;
        for seg in segments {
            let existing = self.read(|s| s.child_named(cur, seg))?;
            cur = match existing {
                Some(id) => id,
                None => {
                    let id = self.write(|s| s.insert_child(cur, seg))?;
                    trace!("Created data holder {} under {}", seg, cur);
                    self.notify(cur, id, DataChange::new(ChangeKind::ChildCreated));
                    id
                }
            };
        }
        Ok(cur)
    }

    /// Resolve a dotted path without creating anything.
    pub fn find_existing(&self, from: HolderId, path: &str) -> Result<Option<HolderId>> {
        let segments = split_path(path)?;
        self.read(|s| {
            s.holder(from)?;
            let mut cur = from;
            for seg in segments {
                match s.child_named(cur, seg)? {
                    Some(id) => cur = id,
                    None => return Ok(None),
                }
            }
            Ok(Some(cur))
        })
    }

    /// Whether the holder still exists.
    pub fn contains(&self, id: HolderId) -> bool {
        self.read(|s| Ok(s.holders.contains_key(&id))).unwrap_or(false)
    }

    pub fn name(&self, id: HolderId) -> Result<String> {
        self.read(|s| Ok(s.holder(id)?.name.clone()))
    }

    pub fn parent(&self, id: HolderId) -> Result<Option<HolderId>> {
        self.read(|s| Ok(s.holder(id)?.parent))
    }

    /// Dotted path from the root (the root itself is the empty path).
    pub fn path(&self, id: HolderId) -> Result<String> {
        self.read(|s| {
            let mut names = vec![s.holder(id)?.name.clone()];
            for a in s.ancestors(id) {
                if a != self.root {
                    names.push(s.holder(a)?.name.clone());
                }
            }
            if id == self.root {
                names.clear();
            }
            names.reverse();
            Ok(names.join("."))
        })
    }

    /// Iterator over a snapshot of the current children.
    pub fn children(&self, id: HolderId) -> Result<ChildIter> {
        self.read(|s| {
            Ok(ChildIter {
                ids: s.holder(id)?.children.clone(),
                pos: 0,
            })
        })
    }

    // --- Values ---

    pub fn get_value(&self, id: HolderId) -> Result<DataValue> {
        self.read(|s| Ok(s.holder(id)?.value.clone()))
    }

    pub fn get_type(&self, id: HolderId) -> Result<DataType> {
        self.read(|s| Ok(s.holder(id)?.value.data_type()))
    }

    pub fn is_empty(&self, id: HolderId) -> Result<bool> {
        self.read(|s| Ok(s.holder(id)?.value.is_empty()))
    }

    fn get_typed<T>(
        &self,
        id: HolderId,
        expected: DataType,
        extract: impl FnOnce(&DataValue) -> Option<T>,
    ) -> Result<T> {
        self.read(|s| {
            let value = &s.holder(id)?.value;
            extract(value).ok_or(ZWayError::InvalidType { expected, actual: value.data_type() })
        })
    }

    pub fn get_bool(&self, id: HolderId) -> Result<bool> {
        self.get_typed(id, DataType::Boolean, DataValue::as_bool)
    }

    pub fn get_int(&self, id: HolderId) -> Result<i32> {
        self.get_typed(id, DataType::Integer, DataValue::as_int)
    }

    pub fn get_float(&self, id: HolderId) -> Result<f32> {
        self.get_typed(id, DataType::Float, DataValue::as_float)
    }

    pub fn get_string(&self, id: HolderId) -> Result<String> {
        self.get_typed(id, DataType::String, |v| v.as_str().map(str::to_string))
    }

    pub fn get_binary(&self, id: HolderId) -> Result<Vec<u8>> {
        self.get_typed(id, DataType::Binary, |v| v.as_bytes().map(<[u8]>::to_vec))
    }

    pub fn get_int_array(&self, id: HolderId) -> Result<Vec<i32>> {
        self.get_typed(id, DataType::ArrayOfInteger, |v| match v {
            DataValue::IntArray(a) => Some(a.clone()),
            _ => None,
        })
    }

    pub fn get_float_array(&self, id: HolderId) -> Result<Vec<f32>> {
        self.get_typed(id, DataType::ArrayOfFloat, |v| match v {
            DataValue::FloatArray(a) => Some(a.clone()),
            _ => None,
        })
    }

    pub fn get_string_array(&self, id: HolderId) -> Result<Vec<String>> {
        self.get_typed(id, DataType::ArrayOfString, |v| match v {
            DataValue::StringArray(a) => Some(a.clone()),
            _ => None,
        })
    }

    pub fn update_time(&self, id: HolderId) -> Result<Option<DateTime<Utc>>> {
        self.read(|s| Ok(s.holder(id)?.update_time))
    }

    pub fn invalidate_time(&self, id: HolderId) -> Result<Option<DateTime<Utc>>> {
        self.read(|s| Ok(s.holder(id)?.invalidate_time))
    }

    /// True unless the holder was invalidated after its last update.
    pub fn is_valid(&self, id: HolderId) -> Result<bool> {
        self.read(|s| {
            let h = s.holder(id)?;
            Ok(match (h.update_time, h.invalidate_time) {
                (_, None) => true,
                (Some(u), Some(i)) => u > i,
                (None, Some(_)) => false,
            })
        })
    }

    pub fn is_read_only(&self, id: HolderId) -> Result<bool> {
        self.read(|s| Ok(s.holder(id)?.read_only))
    }

    /// Flag a holder read-only. Writes then fail with `InvalidOperation`.
    pub fn set_read_only(&self, id: HolderId, read_only: bool) -> Result<()> {
        self.write(|s| {
            s.holder_mut(id)?.read_only = read_only;
            Ok(())
        })
    }

    fn check_writable(s: &TreeState, id: HolderId, value: &DataValue) -> Result<()> {
        let h = s.holder(id)?;
        if h.read_only {
            return Err(ZWayError::invalid_operation(format!(
                "data holder '{}' is read-only",
                h.name
            )));
        }
        if !h.value.is_empty()
            && !value.is_empty()
            && h.value.data_type() != value.data_type()
        {
            return Err(ZWayError::InvalidType {
                expected: h.value.data_type(),
                actual: value.data_type(),
            });
        }
        Ok(())
    }

    /// Store a value.
    ///
    /// Fails with `InvalidType` when the holder already holds a non-empty
    /// value of another type. Writing a bit-identical value still moves the
    /// update time and notifies with the phantom flag.
    pub fn set(&self, id: HolderId, value: impl Into<DataValue>) -> Result<()> {
        let value = value.into();
        let _guard = self.state.lock();
        let phantom = self.write(|s| {
            Self::check_writable(s, id, &value)?;
            let stamp = s.stamp();
            let h = s.holder_mut(id)?;
            let phantom = h.value.same_bits(&value);
            h.value = value;
            h.update_time = Some(stamp);
            Ok(phantom)
        })?;
        let change = DataChange::new(ChangeKind::Updated);
        self.notify(id, id, if phantom { change.phantom() } else { change });
        Ok(())
    }

    pub fn set_empty(&self, id: HolderId) -> Result<()> {
        self.set(id, DataValue::Empty)
    }

    pub fn set_bool(&self, id: HolderId, value: bool) -> Result<()> {
        self.set(id, DataValue::Bool(value))
    }

    pub fn set_int(&self, id: HolderId, value: i32) -> Result<()> {
        self.set(id, DataValue::Int(value))
    }

    pub fn set_float(&self, id: HolderId, value: f32) -> Result<()> {
        self.set(id, DataValue::Float(value))
    }

    pub fn set_string(&self, id: HolderId, value: impl Into<String>) -> Result<()> {
        self.set(id, DataValue::String(value.into()))
    }

    pub fn set_binary(&self, id: HolderId, value: &[u8]) -> Result<()> {
        self.set(id, DataValue::Binary(value.to_vec()))
    }

    pub fn set_int_array(&self, id: HolderId, value: &[i32]) -> Result<()> {
        self.set(id, DataValue::IntArray(value.to_vec()))
    }

    pub fn set_float_array(&self, id: HolderId, value: &[f32]) -> Result<()> {
        self.set(id, DataValue::FloatArray(value.to_vec()))
    }

    pub fn set_string_array(&self, id: HolderId, value: &[String]) -> Result<()> {
        self.set(id, DataValue::StringArray(value.to_vec()))
    }

    /// Apply several path/value writes below `from` as one unit.
    ///
    /// Every write is checked before the first one is applied, against the
    /// type its holder will have after the earlier writes of the batch. If
    /// any would fail, nothing changes.
    pub fn apply(&self, from: HolderId, updates: &[(String, DataValue)]) -> Result<()> {
        let _guard = self.state.lock();
        let mut pending: HashMap<String, DataType> = HashMap::new();
        for (path, value) in updates {
            let key = split_path(path)?.join(".");
            let current = match pending.get(&key) {
                Some(ty) => *ty,
                None => match self.find_existing(from, path)? {
                    Some(id) => self.read(|s| {
                        Self::check_writable(s, id, value)?;
                        Ok(s.holder(id)?.value.data_type())
                    })?,
                    None => DataType::Empty,
                },
            };
            let incoming = value.data_type();
            if current != DataType::Empty && incoming != DataType::Empty && current != incoming {
                return Err(ZWayError::InvalidType { expected: current, actual: incoming });
            }
            pending.insert(key, incoming);
        }
        for (path, value) in updates {
            let id = self.find(from, path)?;
            self.set(id, value.clone())?;
        }
        Ok(())
    }

    /// Mark the value stale without clearing it.
    pub fn invalidate(&self, id: HolderId, invalidate_children: bool) -> Result<()> {
        let _guard = self.state.lock();
        let targets = self.read(|s| {
            s.holder(id)?;
            let mut out = Vec::new();
            if invalidate_children {
                s.subtree_pre_order(id, &mut out);
            } else {
                out.push(id);
            }
            Ok(out)
        })?;
        for target in targets {
            let stamped = self.write(|s| {
                let stamp = s.stamp();
                Ok(match s.holders.get_mut(&target) {
                    Some(h) => {
                        h.invalidate_time = Some(stamp);
                        true
                    }
                    None => false,
                })
            })?;
            if stamped {
                self.notify(target, target, DataChange::new(ChangeKind::Invalidated));
            }
        }
        Ok(())
    }

    /// Detach and destroy `child` and its subtree.
    ///
    /// Every holder in the subtree receives `Deleted` bottom-up, then the
    /// watching ancestors receive `Deleted | CHILD_EVENT` for `child`.
    pub fn remove_child(&self, parent: HolderId, child: HolderId) -> Result<()> {
        let _guard = self.state.lock();
        let doomed = self.read(|s| {
            if s.holder(child)?.parent != Some(parent) {
                return Err(ZWayError::invalid_arg(format!(
                    "data holder {} is not a child of {}",
                    child, parent
                )));
            }
            let mut out = Vec::new();
            s.subtree_post_order(child, &mut out);
            Ok(out)
        })?;

        let deleted = DataChange::new(ChangeKind::Deleted);
        for id in &doomed {
            let direct = self.read(|s| {
                Ok(s.holders
                    .get(id)
                    .map(|h| h.callbacks.snapshot(|_| true))
                    .unwrap_or_default())
            })?;
            for (cb, arg, _) in direct {
                cb.on_change(self, deleted, *id, &arg);
            }
        }
        let bubbled = self.read(|s| Ok(Self::collect_watchers(s, child, deleted)))?;
        Self::invoke(self, child, bubbled);

        self.write(|s| {
            if let Some(p) = s.holders.get_mut(&parent) {
                p.children.retain(|c| *c != child);
            }
            // callbacks may have grown the subtree while it was being torn down
            let mut all = Vec::new();
            s.subtree_post_order(child, &mut all);
            for id in all {
                s.holders.remove(&id);
            }
            Ok(())
        })?;
        debug!("Removed data holder {} from {}", child, parent);
        Ok(())
    }

    /// Create (or return) a direct child by name.
    pub fn create_child(&self, parent: HolderId, name: &str) -> Result<HolderId> {
        if name.is_empty() || name.contains('.') {
            return Err(ZWayError::invalid_arg(format!("invalid data holder name '{}'", name)));
        }
        self.find(parent, name)
    }

    // --- Callbacks ---

    /// Register a callback; an already registered callback is not added
    /// again whatever its argument. Returns whether it was added.
    pub fn add_callback(
        &self,
        id: HolderId,
        callback: DataCallbackRef,
        watch_children: bool,
        arg: CallbackArg,
    ) -> Result<bool> {
        self.write(|s| Ok(s.holder_mut(id)?.callbacks.add(callback, watch_children, arg)))
    }

    /// Register a callback; only an identical (callback, argument) pair is
    /// suppressed. Returns whether it was added.
    pub fn add_callback_ex(
        &self,
        id: HolderId,
        callback: DataCallbackRef,
        watch_children: bool,
        arg: CallbackArg,
    ) -> Result<bool> {
        self.write(|s| Ok(s.holder_mut(id)?.callbacks.add_ex(callback, watch_children, arg)))
    }

    /// Remove every registration of `callback`. Returns how many went.
    pub fn remove_callback(&self, id: HolderId, callback: &DataCallbackRef) -> Result<usize> {
        self.write(|s| Ok(s.holder_mut(id)?.callbacks.remove(callback)))
    }

    /// Remove the single (callback, argument) registration.
    pub fn remove_callback_ex(
        &self,
        id: HolderId,
        callback: &DataCallbackRef,
        arg: &CallbackArg,
    ) -> Result<bool> {
        self.write(|s| Ok(s.holder_mut(id)?.callbacks.remove_ex(callback, arg)))
    }

    pub fn callback_count(&self, id: HolderId) -> Result<usize> {
        self.read(|s| Ok(s.holder(id)?.callbacks.len()))
    }

    fn collect_watchers(s: &TreeState, origin: HolderId, change: DataChange) -> Pending {
        let mut out = Vec::new();
        for a in s.ancestors(origin) {
            if let Some(h) = s.holders.get(&a) {
                for (cb, arg, _) in h.callbacks.snapshot(|watch| watch) {
                    out.push((cb, arg, change.bubbled()));
                }
            }
        }
        out
    }

    fn invoke(&self, affected: HolderId, pending: Pending) {
        for (cb, arg, change) in pending {
            cb.on_change(self, change, affected, &arg);
        }
    }

    /// Direct callbacks of `origin`, then watching ancestors of `origin`.
    /// Called with the lock held and no borrow outstanding.
    fn notify(&self, origin: HolderId, affected: HolderId, change: DataChange) {
        let pending = self
            .read(|s| {
                let mut out: Pending = s
                    .holder(origin)?
                    .callbacks
                    .snapshot(|_| true)
                    .into_iter()
                    .map(|(cb, arg, _)| (cb, arg, change))
                    .collect();
                out.extend(Self::collect_watchers(s, origin, change));
                Ok(out)
            })
            .unwrap_or_default();
        self.invoke(affected, pending);
    }

    // --- Diagnostics ---

    /// JSON dump of a subtree: type, value, times and children by name.
    pub fn snapshot_json(&self, id: HolderId) -> Result<serde_json::Value> {
        let _guard = self.state.lock();
        self.read(|s| Self::holder_json(s, id))
    }

    fn holder_json(s: &TreeState, id: HolderId) -> Result<serde_json::Value> {
        let h = s.holder(id)?;
        let mut children = serde_json::Map::new();
        for c in &h.children {
            let child = s
                .holders
                .get(c)
                .ok_or_else(|| {
                    internal_error(format!("child {} of {} is not in the tree", c, id))
                })?;
            children.insert(child.name.clone(), Self::holder_json(s, *c)?);
        }
        Ok(json!({
            "type": h.value.data_type().as_str(),
            "value": serde_json::to_value(&h.value).unwrap_or(serde_json::Value::Null),
            "updateTime": h.update_time.map(|t| t.to_rfc3339()),
            "invalidateTime": h.invalidate_time.map(|t| t.to_rfc3339()),
            "children": children,
        }))
    }
}

/// Restartable iterator over a snapshot of a holder's children.
///
/// The snapshot is taken when the iterator is created; children added or
/// removed afterwards do not show up. Removed children are still yielded
/// and fail on use.
#[derive(Debug, Clone)]
pub struct ChildIter {
    ids: Vec<HolderId>,
    pos: usize,
}

impl ChildIter {
    /// Go back to the first child of the snapshot.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl Iterator for ChildIter {
    type Item = HolderId;

    fn next(&mut self) -> Option<HolderId> {
        let id = self.ids.get(self.pos).copied();
        if id.is_some() {
            self.pos += 1;
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::data::callback::data_callback;

    type Log = Arc<Mutex<Vec<(String, u8, HolderId)>>>;

    fn recorder(tag: &str, log: &Log) -> DataCallbackRef {
        let tag = tag.to_string();
        let log = log.clone();
        data_callback(move |_, change, holder, _| {
            log.lock().unwrap().push((tag.clone(), change.bits(), holder));
        })
    }

    #[test]
    fn test_find_creates_and_resolves() {
        let tree = DataTree::new();
        let a = tree.find(tree.root(), "devices.3.data").unwrap();
        let b = tree.find(tree.root(), "devices.3.data").unwrap();
        assert_eq!(a, b);
        assert_eq!(tree.path(a).unwrap(), "devices.3.data");
        assert_eq!(tree.name(a).unwrap(), "data");
        assert_eq!(tree.find(a, "").unwrap(), a);
        assert_eq!(tree.path(tree.root()).unwrap(), "");
    }

    #[test]
    fn test_find_rejects_malformed_path() {
        let tree = DataTree::new();
        assert!(matches!(tree.find(tree.root(), "a..b"), Err(ZWayError::InvalidArg { .. })));
        assert!(matches!(tree.find(tree.root(), ".a"), Err(ZWayError::InvalidArg { .. })));
        assert!(tree.find_existing(tree.root(), "a").unwrap().is_none());
    }

    #[test]
    fn test_set_get_and_update_time_increases() {
        let tree = DataTree::new();
        let h = tree.find(tree.root(), "level").unwrap();
        tree.set_int(h, 10).unwrap();
        let t1 = tree.update_time(h).unwrap().unwrap();
        tree.set_int(h, 20).unwrap();
        let t2 = tree.update_time(h).unwrap().unwrap();
        assert_eq!(tree.get_int(h).unwrap(), 20);
        assert!(t2 > t1);
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let tree = DataTree::new();
        let h = tree.find(tree.root(), "flag").unwrap();
        tree.set_bool(h, true).unwrap();
        let err = tree.set_int(h, 1).unwrap_err();
        assert!(matches!(
            err,
            ZWayError::InvalidType { expected: DataType::Boolean, actual: DataType::Integer }
        ));
        assert!(tree.get_bool(h).unwrap());
        assert!(matches!(tree.get_int(h), Err(ZWayError::InvalidType { .. })));

        tree.set_empty(h).unwrap();
        tree.set_int(h, 1).unwrap();
        assert_eq!(tree.get_type(h).unwrap(), DataType::Integer);
    }

    #[test]
    fn test_read_only_holder() {
        let tree = DataTree::new();
        let h = tree.find(tree.root(), "nodeId").unwrap();
        tree.set_int(h, 1).unwrap();
        tree.set_read_only(h, true).unwrap();
        assert!(matches!(tree.set_int(h, 2), Err(ZWayError::InvalidOperation { .. })));
        assert_eq!(tree.get_int(h).unwrap(), 1);
    }

    #[test]
    fn test_phantom_update() {
        let tree = DataTree::new();
        let h = tree.find(tree.root(), "x").unwrap();
        let log = Log::default();
        tree.add_callback(h, recorder("x", &log), false, CallbackArg::none()).unwrap();
        tree.set_float(h, 1.5).unwrap();
        tree.set_float(h, 1.5).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log[0].1, 0x01);
        assert_eq!(log[1].1, 0x41);
    }

    #[test]
    fn test_invalidate_keeps_value() {
        let tree = DataTree::new();
        let h = tree
            .find(tree.root(), "devices.3.instances.0.commandClasses.48.data.level")
            .unwrap();
        tree.set_bool(h, true).unwrap();
        tree.invalidate(h, false).unwrap();
        assert!(tree.get_bool(h).unwrap());
        assert!(!tree.is_empty(h).unwrap());
        let updated = tree.update_time(h).unwrap().unwrap();
        let invalidated = tree.invalidate_time(h).unwrap().unwrap();
        assert!(invalidated > updated);
        assert!(!tree.is_valid(h).unwrap());
        tree.set_bool(h, false).unwrap();
        assert!(tree.is_valid(h).unwrap());
    }

    #[test]
    fn test_invalidate_children() {
        let tree = DataTree::new();
        let parent = tree.find(tree.root(), "p").unwrap();
        let a = tree.find(parent, "a").unwrap();
        let b = tree.find(parent, "b.c").unwrap();
        tree.invalidate(parent, true).unwrap();
        assert!(tree.invalidate_time(a).unwrap().is_some());
        assert!(tree.invalidate_time(b).unwrap().is_some());

        let lone = tree.find(tree.root(), "q.r").unwrap();
        let q = tree.parent(lone).unwrap().unwrap();
        tree.invalidate(q, false).unwrap();
        assert!(tree.invalidate_time(lone).unwrap().is_none());
    }

    #[test]
    fn test_watch_children_bubbling() {
        let tree = DataTree::new();
        let parent = tree.find(tree.root(), "dev").unwrap();
        let child = tree.find(parent, "level").unwrap();
        let log = Log::default();

        tree.add_callback(parent, recorder("plain", &log), false, CallbackArg::none()).unwrap();
        tree.set_int(child, 5).unwrap();
        assert!(log.lock().unwrap().is_empty());

        tree.add_callback(parent, recorder("watch", &log), true, CallbackArg::none()).unwrap();
        tree.set_int(child, 6).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], ("watch".to_string(), 0x81, child));
    }

    #[test]
    fn test_direct_before_bubbled_and_walk_to_root() {
        let tree = DataTree::new();
        let leaf = tree.find(tree.root(), "a.b.c").unwrap();
        let b = tree.parent(leaf).unwrap().unwrap();
        let log = Log::default();
        tree.add_callback(tree.root(), recorder("root", &log), true, CallbackArg::none()).unwrap();
        tree.add_callback(leaf, recorder("leaf", &log), false, CallbackArg::none()).unwrap();
        tree.add_callback(b, recorder("b", &log), true, CallbackArg::none()).unwrap();

        tree.set_string(leaf, "x").unwrap();
        let tags: Vec<String> = log.lock().unwrap().iter().map(|e| e.0.clone()).collect();
        assert_eq!(tags, vec!["leaf", "b", "root"]);
    }

    #[test]
    fn test_registration_order() {
        let tree = DataTree::new();
        let h = tree.find(tree.root(), "h").unwrap();
        let log = Log::default();
        for tag in ["first", "second", "third"] {
            tree.add_callback(h, recorder(tag, &log), false, CallbackArg::none()).unwrap();
        }
        tree.set_int(h, 1).unwrap();
        let tags: Vec<String> = log.lock().unwrap().iter().map(|e| e.0.clone()).collect();
        assert_eq!(tags, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_child_created_notification() {
        let tree = DataTree::new();
        let parent = tree.find(tree.root(), "dev").unwrap();
        let log = Log::default();
        tree.add_callback(parent, recorder("p", &log), false, CallbackArg::none()).unwrap();
        let child = tree.find(parent, "new").unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log[0], ("p".to_string(), 0x04, child));
    }

    #[test]
    fn test_remove_child_fires_deleted_bottom_up() {
        let tree = DataTree::new();
        let parent = tree.find(tree.root(), "devices").unwrap();
        let dev = tree.find(parent, "5").unwrap();
        let data = tree.find(dev, "data").unwrap();
        let log = Log::default();
        tree.add_callback(dev, recorder("dev", &log), false, CallbackArg::none()).unwrap();
        tree.add_callback(data, recorder("data", &log), false, CallbackArg::none()).unwrap();
        tree.add_callback(tree.root(), recorder("root", &log), true, CallbackArg::none()).unwrap();

        tree.remove_child(parent, dev).unwrap();
        let log = log.lock().unwrap();
        assert_eq!(log[0], ("data".to_string(), 0x03, data));
        assert_eq!(log[1], ("dev".to_string(), 0x03, dev));
        assert_eq!(log[2], ("root".to_string(), 0x83, dev));
        assert!(!tree.contains(dev));
        assert!(!tree.contains(data));
        assert!(tree.children(parent).unwrap().is_empty());
        assert!(matches!(tree.get_value(data), Err(ZWayError::InvalidArg { .. })));
    }

    #[test]
    fn test_remove_child_wrong_parent() {
        let tree = DataTree::new();
        let a = tree.find(tree.root(), "a").unwrap();
        let b = tree.find(tree.root(), "b.c").unwrap();
        assert!(matches!(tree.remove_child(a, b), Err(ZWayError::InvalidArg { .. })));
    }

    #[test]
    fn test_child_iter_is_snapshot_and_restartable() {
        let tree = DataTree::new();
        let parent = tree.find(tree.root(), "p").unwrap();
        let a = tree.find(parent, "a").unwrap();
        let b = tree.find(parent, "b").unwrap();
        let mut iter = tree.children(parent).unwrap();
        assert_eq!(iter.next(), Some(a));
        tree.find(parent, "c").unwrap();
        assert_eq!(iter.next(), Some(b));
        assert_eq!(iter.next(), None);
        iter.restart();
        assert_eq!(iter.count(), 2);
        assert_eq!(tree.children(parent).unwrap().len(), 3);
    }

    #[test]
    fn test_callback_can_reenter_tree() {
        let tree = Arc::new(DataTree::new());
        let source = tree.find(tree.root(), "source").unwrap();
        let mirror = tree.find(tree.root(), "mirror").unwrap();
        let cb = data_callback(move |tree: &DataTree, change, holder, _| {
            if !change.is_child_event() {
                let v = tree.get_int(holder).unwrap();
                tree.set_int(mirror, v * 2).unwrap();
            }
        });
        tree.add_callback(source, cb, false, CallbackArg::none()).unwrap();
        {
            let _lock = tree.lock();
            tree.set_int(source, 21).unwrap();
        }
        assert_eq!(tree.get_int(mirror).unwrap(), 42);
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let tree = DataTree::new();
        let base = tree.find(tree.root(), "cc").unwrap();
        let flag = tree.find(base, "flag").unwrap();
        tree.set_bool(flag, true).unwrap();

        let bad = vec![
            ("level".to_string(), DataValue::Int(99)),
            ("flag".to_string(), DataValue::Int(1)),
        ];
        assert!(tree.apply(base, &bad).is_err());
        assert!(tree.find_existing(base, "level").unwrap().is_none());

        let good = vec![
            ("level".to_string(), DataValue::Int(99)),
            ("flag".to_string(), DataValue::Bool(false)),
        ];
        tree.apply(base, &good).unwrap();
        let level = tree.find_existing(base, "level").unwrap().unwrap();
        assert_eq!(tree.get_int(level).unwrap(), 99);
        assert!(!tree.get_bool(flag).unwrap());
    }

    #[test]
    fn test_apply_checks_repeated_path_against_earlier_write() {
        let tree = DataTree::new();
        let base = tree.find(tree.root(), "cc").unwrap();

        let conflicting = vec![
            ("level".to_string(), DataValue::Int(1)),
            ("level".to_string(), DataValue::Bool(true)),
        ];
        let err = tree.apply(base, &conflicting).unwrap_err();
        assert!(matches!(
            err,
            ZWayError::InvalidType { expected: DataType::Integer, actual: DataType::Boolean }
        ));
        assert!(tree.find_existing(base, "level").unwrap().is_none());

        let level = tree.find(base, "level").unwrap();
        tree.set_int(level, 7).unwrap();
        assert!(tree.apply(base, &conflicting).is_err());
        assert_eq!(tree.get_int(level).unwrap(), 7);

        // Clearing in between lets the type change.
        let cleared = vec![
            ("level".to_string(), DataValue::Int(1)),
            ("level".to_string(), DataValue::Empty),
            ("level".to_string(), DataValue::Bool(true)),
        ];
        tree.apply(base, &cleared).unwrap();
        assert!(tree.get_bool(level).unwrap());
    }

    #[test]
    fn test_lock_excludes_other_threads() {
        let tree = Arc::new(DataTree::new());
        let h = tree.find(tree.root(), "shared").unwrap();

        let guard = tree.lock();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let writer = {
            let tree = tree.clone();
            std::thread::spawn(move || {
                tree.set_int(h, 5).unwrap();
                done_tx.send(()).unwrap();
            })
        };

        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(tree.get_value(h).unwrap().is_empty());

        drop(guard);
        done_rx.recv().unwrap();
        writer.join().unwrap();
        assert_eq!(tree.get_int(h).unwrap(), 5);
    }

    #[test]
    fn test_concurrent_writers_get_increasing_update_times() {
        let tree = Arc::new(DataTree::new());
        let writers: Vec<_> = (0..4)
            .map(|n| {
                let tree = tree.clone();
                std::thread::spawn(move || {
                    let h = tree.find(tree.root(), &format!("w{}", n)).unwrap();
                    let mut stamps = Vec::new();
                    for i in 0..200 {
                        tree.set_int(h, i).unwrap();
                        stamps.push(tree.update_time(h).unwrap().unwrap());
                    }
                    stamps
                })
            })
            .collect();

        let mut all = Vec::new();
        for writer in writers {
            let stamps = writer.join().unwrap();
            assert!(stamps.windows(2).all(|w| w[0] < w[1]));
            all.extend(stamps);
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
        for n in 0..4 {
            let h = tree.find_existing(tree.root(), &format!("w{}", n)).unwrap().unwrap();
            assert_eq!(tree.get_int(h).unwrap(), 199);
        }
    }

    #[test]
    fn test_callbacks_add_remove_through_tree() {
        let tree = DataTree::new();
        let h = tree.find(tree.root(), "h").unwrap();
        let log = Log::default();
        let cb = recorder("c", &log);
        let arg = CallbackArg::new("a");
        assert!(tree.add_callback(h, cb.clone(), false, arg.clone()).unwrap());
        assert!(!tree.add_callback(h, cb.clone(), false, arg.clone()).unwrap());
        assert_eq!(tree.callback_count(h).unwrap(), 1);
        assert_eq!(tree.remove_callback(h, &cb).unwrap(), 1);

        assert!(tree.add_callback_ex(h, cb.clone(), false, arg.clone()).unwrap());
        assert!(tree.add_callback_ex(h, cb.clone(), false, CallbackArg::new("b")).unwrap());
        assert_eq!(tree.callback_count(h).unwrap(), 2);
        assert!(tree.remove_callback_ex(h, &cb, &arg).unwrap());
        assert_eq!(tree.callback_count(h).unwrap(), 1);
        assert_eq!(tree.remove_callback(h, &cb).unwrap(), 1);
        assert_eq!(tree.callback_count(h).unwrap(), 0);
    }

    #[test]
    fn test_snapshot_json() {
        let tree = DataTree::new();
        let h = tree.find(tree.root(), "controller.data.homeId").unwrap();
        tree.set_int(h, 0x1234).unwrap();
        let snap = tree.snapshot_json(tree.root()).unwrap();
        let home = &snap["children"]["controller"]["children"]["data"]["children"]["homeId"];
        assert_eq!(home["type"], "int");
        assert_eq!(home["value"], 0x1234);
        assert!(home["updateTime"].is_string());
    }
}
