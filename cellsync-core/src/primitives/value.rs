//! A single replicated value stored as a plain map entry.

use std::rc::Rc;

use super::{decode_opt, submit, Adapter, AdapterCore, Item};
use crate::convert::{from_json, to_json};
use crate::document::{Disposable, DocumentChange, ReplicatedDocument, TreeRead};
use crate::error::Result;
use crate::path::Path;
use crate::signal::Signal;

#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange<T> {
    pub old_value: Option<T>,
    pub new_value: Option<T>,
}

pub(super) struct ValueInner<T: Item> {
    core: AdapterCore,
    changed: Signal<ValueChange<T>>,
}

impl<T: Item> Adapter for ValueInner<T> {
    fn core(&self) -> &AdapterCore {
        &self.core
    }
}

impl<T: Item> Disposable for ValueInner<T> {
    /// Cascading disposal only detaches; the tree entry is left for others.
    fn dispose(&self) {
        if self.core.detach() {
            self.changed.clear();
        }
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl<T: Item> ValueInner<T> {
    fn on_change(&self, change: &DocumentChange) {
        let path = self.core.path();
        for entry in change.diff.iter() {
            let Some((old, new)) = entry.replacement_of(path) else {
                continue;
            };
            if old == new {
                continue;
            }
            self.changed.emit(&ValueChange {
                old_value: decode_opt(old),
                new_value: decode_opt(new),
            });
        }
    }
}

/// One value of type `T` at a path.
pub struct ReplicatedValue<T: Item> {
    inner: Rc<ValueInner<T>>,
}

impl<T: Item> Clone for ReplicatedValue<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Item> ReplicatedValue<T> {
    pub(crate) fn new(doc: &ReplicatedDocument, path: Path) -> Self {
        let inner = Rc::new(ValueInner {
            core: AdapterCore::new(doc, path),
            changed: Signal::new(),
        });
        inner.core.attach(doc, &inner, ValueInner::on_change);
        Self { inner }
    }

    pub(crate) fn disposable(&self) -> Rc<dyn Disposable> {
        self.inner.clone()
    }

    pub fn path(&self) -> &Path {
        self.inner.core.path()
    }

    pub fn changed(&self) -> &Signal<ValueChange<T>> {
        &self.inner.changed
    }

    pub fn get(&self) -> Result<Option<T>> {
        let path = self.path();
        match self.inner.core.read(|r| r.get(path))? {
            Some(value) => Ok(Some(from_json(value)?)),
            None => Ok(None),
        }
    }

    /// Store `value`. A no-op when it is deep-equal to the current value.
    pub fn set(&self, value: T) -> Result<()> {
        let json = to_json(&value)?;
        let path = self.path();
        if self.inner.core.read(|r| r.get(path))?.as_ref() == Some(&json) {
            return Ok(());
        }
        submit(&self.inner, move |doc, inner| {
            let path = inner.core.path();
            let mut previous = None;
            let committed = doc.commit_local(|m| {
                previous = m.get(path)?;
                if previous.as_ref() == Some(&json) {
                    return Ok(());
                }
                m.set(path, &json)
            })?;
            if committed.is_some() {
                inner.changed.emit(&ValueChange {
                    old_value: decode_opt(previous),
                    new_value: Some(value),
                });
            }
            Ok(())
        })
    }

    /// Delete the tree entry and detach.
    pub fn dispose(&self) -> Result<()> {
        if self.inner.core.is_disposed() {
            return Ok(());
        }
        let outcome = submit(&self.inner, |doc, inner| {
            doc.commit_local(|m| m.remove(inner.core.path()).map(drop))?;
            Ok(())
        });
        self.inner.dispose();
        outcome
    }

    /// Detach without touching the tree.
    pub fn release(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.core.is_disposed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentConfig;
    use serde_json::json;
    use std::cell::RefCell;

    fn setup() -> (ReplicatedDocument, ReplicatedValue<Vec<String>>, Rc<RefCell<Vec<ValueChange<Vec<String>>>>>) {
        let doc = ReplicatedDocument::new(DocumentConfig::default());
        let value = doc.view(["nb", "cells", "c1"]).create_value("tags").unwrap();
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        value
            .changed()
            .connect(move |e: &ValueChange<Vec<String>>| sink.borrow_mut().push(e.clone()));
        (doc, value, events)
    }

    #[test]
    fn test_set_deep_equal_is_noop() {
        let (doc, value, events) = setup();
        value.set(vec!["a".into(), "b".into()]).unwrap();
        value.set(vec!["a".into(), "b".into()]).unwrap();
        assert_eq!(events.borrow().len(), 1);
        assert_eq!(events.borrow()[0].old_value, None);
        assert_eq!(doc.take_outbound().len(), 1);
        assert_eq!(value.get().unwrap(), Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_dispose_removes_entry() {
        let (doc, value, _) = setup();
        value.set(vec!["x".into()]).unwrap();
        value.dispose().unwrap();
        assert!(value.is_disposed());
        assert_eq!(doc.to_json().unwrap(), json!({"nb": {"cells": {"c1": {}}}}));
        assert!(value.get().is_err());
    }

    #[test]
    fn test_release_keeps_entry() {
        let (doc, value, _) = setup();
        value.set(vec!["x".into()]).unwrap();
        value.release();
        assert_eq!(doc.to_json().unwrap(), json!({"nb": {"cells": {"c1": {"tags": ["x"]}}}}));
    }

    #[test]
    fn test_remote_set_emits_change() {
        let (doc, value, events) = setup();
        value.set(vec!["local".into()]).unwrap();
        let peer = ReplicatedDocument::new(DocumentConfig::default());
        for cs in doc.take_outbound() {
            peer.merge_change_set(&cs).unwrap();
        }
        let remote = peer
            .view(["nb", "cells", "c1"])
            .create_value::<Vec<String>>("tags")
            .unwrap();
        remote.set(vec!["remote".into()]).unwrap();
        for cs in peer.take_outbound() {
            doc.merge_change_set(&cs).unwrap();
        }
        let events = events.borrow();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].old_value, Some(vec!["local".to_string()]));
        assert_eq!(events[1].new_value, Some(vec!["remote".to_string()]));
    }
}
