//! Replicated string-keyed map.

use serde_json::{Map as JsonMap, Value};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use super::{decode_opt, default_cmp, submit, Adapter, AdapterCore, Item, ItemCmp};
use crate::convert::{from_json, to_json};
use crate::diff::Edit;
use crate::document::{Disposable, DocumentChange, ReplicatedDocument, TreeRead};
use crate::error::Result;
use crate::path::Path;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapChangeKind {
    Add,
    Remove,
    Change,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapChange<T> {
    pub kind: MapChangeKind,
    pub key: String,
    pub old_value: Option<T>,
    pub new_value: Option<T>,
}

impl<T> MapChange<T> {
    /// Classify an entry transition. `None` when nothing changed.
    fn between(key: String, old_value: Option<T>, new_value: Option<T>) -> Option<Self> {
        let kind = match (&old_value, &new_value) {
            (None, None) => return None,
            (None, Some(_)) => MapChangeKind::Add,
            (Some(_), None) => MapChangeKind::Remove,
            (Some(_), Some(_)) => MapChangeKind::Change,
        };
        Some(Self { kind, key, old_value, new_value })
    }
}

pub(super) struct MapInner<T: Item> {
    core: AdapterCore,
    changed: Signal<MapChange<T>>,
    cmp: RefCell<ItemCmp<T>>,
}

impl<T: Item> Adapter for MapInner<T> {
    fn core(&self) -> &AdapterCore {
        &self.core
    }
}

impl<T: Item> Disposable for MapInner<T> {
    fn dispose(&self) {
        if self.core.detach() {
            self.changed.clear();
        }
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl<T: Item> MapInner<T> {
    fn on_change(&self, change: &DocumentChange) {
        let path = self.core.path();
        for entry in change.diff.iter() {
            if entry.targets(path) {
                if let Edit::Updated { key, old, new } = &entry.edit {
                    self.emit(key.clone(), decode_opt(old.clone()), decode_opt(new.clone()));
                }
            } else if let Some((old, new)) = entry.replacement_of(path) {
                let old = as_object(old);
                let new = as_object(new);
                let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
                for key in keys {
                    let (before, after) = (old.get(key), new.get(key));
                    if before == after {
                        continue;
                    }
                    self.emit(key.clone(), decode_opt(before.cloned()), decode_opt(after.cloned()));
                }
            }
        }
    }

    fn emit(&self, key: String, old_value: Option<T>, new_value: Option<T>) {
        if let Some(event) = MapChange::between(key, old_value, new_value) {
            self.changed.emit(&event);
        }
    }
}

fn as_object(value: Option<Value>) -> JsonMap<String, Value> {
    match value {
        Some(Value::Object(fields)) => fields,
        _ => JsonMap::new(),
    }
}

/// Map from string keys to `T` at a path.
pub struct ReplicatedMap<T: Item> {
    inner: Rc<MapInner<T>>,
}

impl<T: Item> Clone for ReplicatedMap<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Item> ReplicatedMap<T> {
    pub(crate) fn new(doc: &ReplicatedDocument, path: Path) -> Self {
        let inner = Rc::new(MapInner {
            core: AdapterCore::new(doc, path),
            changed: Signal::new(),
            cmp: default_cmp(),
        });
        inner.core.attach(doc, &inner, MapInner::on_change);
        Self { inner }
    }

    /// Replace the value comparator used by `set` to skip no-op writes.
    pub fn with_comparator(self, cmp: impl Fn(&T, &T) -> bool + 'static) -> Self {
        *self.inner.cmp.borrow_mut() = Rc::new(cmp);
        self
    }

    fn same(&self, a: &T, b: &T) -> bool {
        let cmp = self.inner.cmp.borrow().clone();
        cmp(a, b)
    }

    pub(crate) fn disposable(&self) -> Rc<dyn Disposable> {
        self.inner.clone()
    }

    pub fn path(&self) -> &Path {
        self.inner.core.path()
    }

    pub fn changed(&self) -> &Signal<MapChange<T>> {
        &self.inner.changed
    }

    pub fn get(&self, key: &str) -> Result<Option<T>> {
        let path = self.path();
        match self.inner.core.read(|r| r.map_get(path, key))? {
            Some(value) => Ok(Some(from_json(value)?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, key: &str) -> Result<bool> {
        let path = self.path();
        Ok(self.inner.core.read(|r| r.map_get(path, key))?.is_some())
    }

    /// Keys in sorted order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let path = self.path();
        self.inner.core.read(|r| r.map_keys(path))
    }

    /// Values in key order.
    pub fn values(&self) -> Result<Vec<T>> {
        self.keys()?
            .iter()
            .filter_map(|key| self.get(key).transpose())
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Set `key`, returning the previous value. A no-op (no event, no
    /// change-set) if the comparator deems the old and new value equal.
    ///
    /// Fails with [`CollabError::InvalidValue`](crate::CollabError::InvalidValue)
    /// if `value` cannot be represented as JSON.
    pub fn set(&self, key: &str, value: T) -> Result<Option<T>> {
        let json = to_json(&value)?;
        let old = self.get(key)?;
        if old.as_ref().is_some_and(|old| self.same(old, &value)) {
            return Ok(old);
        }
        let key = key.to_string();
        submit(&self.inner, move |doc, inner| {
            let path = inner.core.path();
            let mut previous = None;
            let committed = doc.commit_local(|m| {
                previous = m.map_get(path, &key)?;
                m.map_set(path, &key, &json)
            })?;
            if committed.is_some() {
                inner.emit(key, decode_opt(previous), Some(value));
            }
            Ok(())
        })?;
        Ok(old)
    }

    /// Delete `key`, returning its value.
    pub fn delete(&self, key: &str) -> Result<Option<T>> {
        let Some(old) = self.get(key)? else {
            return Ok(None);
        };
        let key = key.to_string();
        submit(&self.inner, move |doc, inner| {
            let path = inner.core.path();
            let mut removed = None;
            let committed = doc.commit_local(|m| {
                removed = m.map_remove(path, &key)?;
                Ok(())
            })?;
            if committed.is_some() {
                inner.emit(key, decode_opt(removed), None);
            }
            Ok(())
        })?;
        Ok(Some(old))
    }

    /// Delete every key in one change, emitting one `Remove` event per key.
    pub fn clear(&self) -> Result<()> {
        if self.is_empty()? {
            return Ok(());
        }
        submit(&self.inner, |doc, inner| {
            let path = inner.core.path();
            let mut removed = Vec::new();
            doc.commit_local(|m| {
                for key in m.map_keys(path)? {
                    if let Some(value) = m.map_remove(path, &key)? {
                        removed.push((key, value));
                    }
                }
                Ok(())
            })?;
            for (key, value) in removed {
                inner.emit(key, decode_opt(Some(value)), None);
            }
            Ok(())
        })
    }

    /// Deep copy of every entry as a JSON object.
    pub fn to_json(&self) -> Result<Value> {
        let path = self.path();
        let value = self.inner.core.read(|r| r.get(path))?;
        Ok(match value {
            Some(Value::Object(fields)) => Value::Object(fields),
            _ => Value::Object(JsonMap::new()),
        })
    }
}
