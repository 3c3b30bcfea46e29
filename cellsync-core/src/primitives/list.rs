//! Replicated list of serializable items.

use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

use super::{default_cmp, submit, Adapter, AdapterCore, Item, ItemCmp};
use crate::convert::to_json;
use crate::diff::{Content, Edit};
use crate::document::{decode_values, Disposable, DocumentChange, ReplicatedDocument, TreeRead};
use crate::error::{CollabError, Result};
use crate::path::Path;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListChangeKind {
    Add,
    Remove,
    Set,
    Move,
}

/// Change event of a [`ReplicatedList`]. `None` indices mean "not applicable".
#[derive(Debug, Clone, PartialEq)]
pub struct ListChange<T> {
    pub kind: ListChangeKind,
    pub old_index: Option<usize>,
    pub new_index: Option<usize>,
    pub old_values: Vec<T>,
    pub new_values: Vec<T>,
}

impl<T> ListChange<T> {
    fn added(index: usize, values: Vec<T>) -> Self {
        Self {
            kind: ListChangeKind::Add,
            old_index: None,
            new_index: Some(index),
            old_values: Vec::new(),
            new_values: values,
        }
    }

    fn removed(index: usize, values: Vec<T>) -> Self {
        Self {
            kind: ListChangeKind::Remove,
            old_index: Some(index),
            new_index: None,
            old_values: values,
            new_values: Vec::new(),
        }
    }
}

pub(super) struct ListInner<T: Item> {
    core: AdapterCore,
    changed: Signal<ListChange<T>>,
    cmp: RefCell<ItemCmp<T>>,
}

impl<T: Item> Adapter for ListInner<T> {
    fn core(&self) -> &AdapterCore {
        &self.core
    }
}

impl<T: Item> Disposable for ListInner<T> {
    fn dispose(&self) {
        if self.core.detach() {
            self.changed.clear();
        }
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl<T: Item> ListInner<T> {
    fn on_change(&self, change: &DocumentChange) {
        let path = self.core.path();
        for entry in change.diff.iter() {
            if entry.targets(path) {
                match &entry.edit {
                    Edit::Inserted { index, content: Content::Values(values) } => {
                        self.changed.emit(&ListChange::added(*index, decode_values(values)));
                    }
                    Edit::Removed { index, content: Content::Values(values) } => {
                        self.changed.emit(&ListChange::removed(*index, decode_values(values)));
                    }
                    _ => {}
                }
            } else if let Some((old, new)) = entry.replacement_of(path) {
                let old = decode_values::<T>(&as_array(old));
                let new = decode_values::<T>(&as_array(new));
                if !old.is_empty() {
                    self.changed.emit(&ListChange::removed(0, old));
                }
                if !new.is_empty() {
                    self.changed.emit(&ListChange::added(0, new));
                }
            }
        }
    }

    /// Insert at `index` (clamped), or append when `None`. Runs inside an op.
    fn insert_values(&self, doc: &ReplicatedDocument, index: Option<usize>, items: Vec<T>, json: Vec<Value>) -> Result<()> {
        let path = self.core.path();
        let mut at = 0;
        let committed = doc.commit_local(|m| {
            let len = m.list_len(path)?;
            at = index.map_or(len, |i| i.min(len));
            m.list_insert(path, at, &json)
        })?;
        if committed.is_some() {
            self.changed.emit(&ListChange::added(at, items));
        }
        Ok(())
    }

    /// Remove `start..end` (clamped to the current length). Runs inside an op.
    fn remove_values(&self, doc: &ReplicatedDocument, start: usize, end: Option<usize>) -> Result<()> {
        let path = self.core.path();
        let mut removed = Vec::new();
        let committed = doc.commit_local(|m| {
            let len = m.list_len(path)?;
            let end = end.map_or(len, |e| e.min(len));
            if start >= end {
                return Ok(());
            }
            removed = m.list_remove(path, start, end - start)?;
            Ok(())
        })?;
        if committed.is_some() {
            self.changed.emit(&ListChange::removed(start, decode_values(&removed)));
        }
        Ok(())
    }
}

fn as_array(value: Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// Ordered list of `T` at a path.
pub struct ReplicatedList<T: Item> {
    inner: Rc<ListInner<T>>,
}

impl<T: Item> Clone for ReplicatedList<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Item> ReplicatedList<T> {
    pub(crate) fn new(doc: &ReplicatedDocument, path: Path) -> Self {
        let inner = Rc::new(ListInner {
            core: AdapterCore::new(doc, path),
            changed: Signal::new(),
            cmp: default_cmp(),
        });
        inner.core.attach(doc, &inner, ListInner::on_change);
        Self { inner }
    }

    /// Replace the item comparator used by `set` and `remove_value`.
    pub fn with_comparator(self, cmp: impl Fn(&T, &T) -> bool + 'static) -> Self {
        *self.inner.cmp.borrow_mut() = Rc::new(cmp);
        self
    }

    pub(crate) fn disposable(&self) -> Rc<dyn Disposable> {
        self.inner.clone()
    }

    pub fn path(&self) -> &Path {
        self.inner.core.path()
    }

    pub fn changed(&self) -> &Signal<ListChange<T>> {
        &self.inner.changed
    }

    fn same(&self, a: &T, b: &T) -> bool {
        let cmp = self.inner.cmp.borrow().clone();
        cmp(a, b)
    }

    // ── reading ─────────────────────────────────────────────────────

    pub fn len(&self) -> Result<usize> {
        let path = self.path();
        self.inner.core.read(|r| r.list_len(path))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn get(&self, index: usize) -> Result<Option<T>> {
        let path = self.path();
        match self.inner.core.read(|r| r.list_get(path, index))? {
            Some(value) => Ok(Some(crate::convert::from_json(value)?)),
            None => Ok(None),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        let path = self.path();
        self.inner
            .core
            .read(|r| r.list_values(path))?
            .into_iter()
            .map(crate::convert::from_json)
            .collect()
    }

    pub fn iter(&self) -> Result<std::vec::IntoIter<T>> {
        Ok(self.to_vec()?.into_iter())
    }

    // ── mutation ────────────────────────────────────────────────────

    /// Replace the item at `index`, returning the previous item.
    ///
    /// A no-op (no event, no change-set) if the comparator deems the items equal.
    pub fn set(&self, index: usize, value: T) -> Result<T> {
        let len = self.len()?;
        let old = self
            .get(index)?
            .ok_or(CollabError::InvalidIndex { index, len })?;
        if self.same(&old, &value) {
            return Ok(old);
        }
        let json = to_json(&value)?;
        submit(&self.inner, move |doc, inner| {
            let path = inner.core.path();
            let mut previous = Value::Null;
            let committed = doc.commit_local(|m| {
                previous = m.list_set(path, index, &json)?;
                Ok(())
            })?;
            if committed.is_some() {
                inner.changed.emit(&ListChange {
                    kind: ListChangeKind::Set,
                    old_index: Some(index),
                    new_index: Some(index),
                    old_values: decode_values(std::slice::from_ref(&previous)),
                    new_values: vec![value],
                });
            }
            Ok(())
        })?;
        Ok(old)
    }

    pub fn push(&self, value: T) -> Result<()> {
        self.push_all(vec![value])
    }

    /// Insert at `index`; indices past the end append.
    pub fn insert(&self, index: usize, value: T) -> Result<()> {
        self.insert_all(index, vec![value])
    }

    pub fn push_all(&self, values: Vec<T>) -> Result<()> {
        self.insert_at(None, values)
    }

    pub fn insert_all(&self, index: usize, values: Vec<T>) -> Result<()> {
        self.insert_at(Some(index), values)
    }

    fn insert_at(&self, index: Option<usize>, values: Vec<T>) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let json = values.iter().map(to_json).collect::<Result<Vec<_>>>()?;
        submit(&self.inner, move |doc, inner| inner.insert_values(doc, index, values, json))
    }

    /// Remove the item at `index`. Out of bounds is a silent no-op returning `None`.
    pub fn remove(&self, index: usize) -> Result<Option<T>> {
        let Some(value) = self.get(index)? else {
            return Ok(None);
        };
        submit(&self.inner, move |doc, inner| inner.remove_values(doc, index, Some(index + 1)))?;
        Ok(Some(value))
    }

    /// Remove the first item equal to `value`, returning its index.
    pub fn remove_value(&self, value: &T) -> Result<Option<usize>> {
        let items = self.to_vec()?;
        let Some(index) = items.iter().position(|item| self.same(item, value)) else {
            return Ok(None);
        };
        self.remove(index)?;
        Ok(Some(index))
    }

    /// Remove `start..end`, returning the number of items removed.
    pub fn remove_range(&self, start: usize, end: usize) -> Result<usize> {
        let end = end.min(self.len()?);
        if start >= end {
            return Ok(0);
        }
        submit(&self.inner, move |doc, inner| inner.remove_values(doc, start, Some(end)))?;
        Ok(end - start)
    }

    /// Remove every item as one `Remove` event. No-op on an empty list.
    pub fn clear(&self) -> Result<()> {
        if self.is_empty()? {
            return Ok(());
        }
        submit(&self.inner, |doc, inner| inner.remove_values(doc, 0, None))
    }

    /// Move the item at `from` so that it ends up at `to`.
    ///
    /// No-op for lists of length <= 1, `from == to`, or out-of-range indices.
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        let len = self.len()?;
        if len <= 1 || from == to || from >= len || to >= len {
            return Ok(());
        }
        submit(&self.inner, move |doc, inner| {
            let path = inner.core.path();
            let mut moved = Vec::new();
            let committed = doc.commit_local(|m| {
                moved = m.list_remove(path, from, 1)?;
                m.list_insert(path, to, &moved)
            })?;
            if committed.is_some() {
                let values: Vec<T> = decode_values(&moved);
                inner.changed.emit(&ListChange {
                    kind: ListChangeKind::Move,
                    old_index: Some(from),
                    new_index: Some(to),
                    old_values: values.clone(),
                    new_values: values,
                });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentConfig;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cell {
        id: String,
        #[serde(default)]
        rev: u32,
    }

    fn cell(id: &str) -> Cell {
        Cell { id: id.into(), rev: 0 }
    }

    fn setup<T: Item>() -> (ReplicatedDocument, ReplicatedList<T>, Rc<RefCell<Vec<ListChange<T>>>>) {
        let doc = ReplicatedDocument::new(DocumentConfig::default());
        let list = doc.view("nb").create_list::<T>("cells").unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        list.changed().connect(move |e: &ListChange<T>| sink.borrow_mut().push(e.clone()));
        (doc, list, events)
    }

    #[test]
    fn test_insert_emits_add() {
        let (_doc, list, events) = setup::<Cell>();
        list.push(cell("a")).unwrap();
        list.insert(0, cell("b")).unwrap();
        list.insert(99, cell("c")).unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![cell("b"), cell("a"), cell("c")]);

        let events = events.borrow();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1], ListChange::added(0, vec![cell("b")]));
        assert_eq!(events[2].new_index, Some(2));
        assert_eq!(events[2].old_index, None);
    }

    #[test]
    fn test_set_equal_value_is_noop() {
        let (doc, list, events) = setup::<i64>();
        list.push_all(vec![1, 2, 3]).unwrap();
        doc.take_outbound();
        events.borrow_mut().clear();

        assert_eq!(list.set(1, 2).unwrap(), 2);
        assert!(events.borrow().is_empty());
        assert!(!doc.has_outbound());

        assert_eq!(list.set(1, 20).unwrap(), 2);
        assert_eq!(list.to_vec().unwrap(), vec![1, 20, 3]);
        let events = events.borrow();
        assert_eq!(events[0].kind, ListChangeKind::Set);
        assert_eq!(events[0].old_values, vec![2]);
        assert_eq!(events[0].new_values, vec![20]);
        assert_eq!(doc.take_outbound().len(), 1);
    }

    #[test]
    fn test_set_out_of_bounds_fails() {
        let (_doc, list, _) = setup::<i64>();
        assert_eq!(list.set(0, 1), Err(CollabError::InvalidIndex { index: 0, len: 0 }));
    }

    #[test]
    fn test_custom_comparator() {
        let (_doc, list, events) = setup::<Cell>();
        let list = list.with_comparator(|a, b| a.id == b.id);
        list.push(cell("x")).unwrap();
        events.borrow_mut().clear();
        list.set(0, Cell { id: "x".into(), rev: 7 }).unwrap();
        assert!(events.borrow().is_empty());
        assert_eq!(list.remove_value(&Cell { id: "x".into(), rev: 1 }).unwrap(), Some(0));
        assert!(list.is_empty().unwrap());
    }

    #[test]
    fn test_remove_out_of_bounds_is_silent() {
        let (_doc, list, events) = setup::<i64>();
        list.push(1).unwrap();
        events.borrow_mut().clear();
        assert_eq!(list.remove(5).unwrap(), None);
        assert!(events.borrow().is_empty());
        assert_eq!(list.remove(0).unwrap(), Some(1));
        assert_eq!(events.borrow()[0], ListChange::removed(0, vec![1]));
    }

    #[test]
    fn test_clear_on_empty_is_noop() {
        let (doc, list, events) = setup::<i64>();
        list.clear().unwrap();
        assert!(events.borrow().is_empty());
        assert!(!doc.has_outbound());

        list.push_all(vec![4, 5, 6]).unwrap();
        events.borrow_mut().clear();
        list.clear().unwrap();
        assert_eq!(*events.borrow(), vec![ListChange::removed(0, vec![4, 5, 6])]);
    }

    #[test]
    fn test_move_noops() {
        let (_doc, list, events) = setup::<i64>();
        list.push(1).unwrap();
        events.borrow_mut().clear();
        list.move_item(0, 0).unwrap();
        assert!(events.borrow().is_empty());

        list.push_all(vec![2, 3, 4, 5]).unwrap();
        events.borrow_mut().clear();
        list.move_item(2, 2).unwrap();
        assert!(events.borrow().is_empty());
    }

    #[test]
    fn test_move_item() {
        let (_doc, list, events) = setup::<i64>();
        list.push_all(vec![0, 1, 2, 3, 4]).unwrap();
        events.borrow_mut().clear();
        list.move_item(0, 3).unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![1, 2, 3, 0, 4]);
        let events = events.borrow();
        assert_eq!(events[0].kind, ListChangeKind::Move);
        assert_eq!((events[0].old_index, events[0].new_index), (Some(0), Some(3)));
        assert_eq!(events[0].new_values, vec![0]);
    }

    #[test]
    fn test_remove_range_clamps() {
        let (_doc, list, events) = setup::<i64>();
        list.push_all(vec![0, 1, 2, 3]).unwrap();
        events.borrow_mut().clear();
        assert_eq!(list.remove_range(2, 10).unwrap(), 2);
        assert_eq!(list.remove_range(5, 6).unwrap(), 0);
        assert_eq!(list.to_vec().unwrap(), vec![0, 1]);
        assert_eq!(*events.borrow(), vec![ListChange::removed(2, vec![2, 3])]);
    }

    #[test]
    fn test_sibling_adapter_sees_local_changes() {
        let (doc, list, events) = setup::<i64>();
        let sibling = doc.view("nb").create_list::<i64>("cells").unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        sibling.changed().connect(move |e: &ListChange<i64>| sink.borrow_mut().push(e.clone()));

        list.push(7).unwrap();
        assert_eq!(*events.borrow(), vec![ListChange::added(0, vec![7])]);
        assert_eq!(*seen.borrow(), vec![ListChange::added(0, vec![7])]);

        sibling.remove(0).unwrap();
        assert_eq!(events.borrow().len(), 2);
        assert_eq!(events.borrow()[1], ListChange::removed(0, vec![7]));
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn test_direct_local_change_emits_event() {
        let (doc, list, events) = setup::<i64>();
        list.push(1).unwrap();
        events.borrow_mut().clear();

        doc.apply_local_change(|m| m.list_insert(&Path::from(["nb", "cells"]), 1, &[json!(2), json!(3)]))
            .unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![1, 2, 3]);
        assert_eq!(*events.borrow(), vec![ListChange::added(1, vec![2, 3])]);
    }

    #[test]
    fn test_remote_changes_translate_to_events() {
        let (doc, list, events) = setup::<Cell>();
        let peer = ReplicatedDocument::new(DocumentConfig::default());
        let remote = peer.view("nb").create_list::<Cell>("cells").unwrap();
        remote.push_all(vec![cell("a"), cell("b")]).unwrap();
        remote.remove(0).unwrap();

        for cs in peer.take_outbound() {
            doc.merge_change_set(&cs).unwrap();
        }
        assert_eq!(list.to_vec().unwrap(), vec![cell("b")]);
        let events = events.borrow();
        // The first change creates the list under "nb": a replacement.
        assert_eq!(events[0], ListChange::added(0, vec![cell("a"), cell("b")]));
        assert_eq!(events[1], ListChange::removed(0, vec![cell("a")]));
    }
}
