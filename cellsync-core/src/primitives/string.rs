//! Replicated text.
//!
//! Offsets are UTF-8 byte offsets and must fall on char boundaries.

use std::rc::Rc;

use super::{submit, Adapter, AdapterCore};
use crate::convert::check_boundary;
use crate::diff::{Content, Edit};
use crate::document::{Disposable, DocumentChange, ReplicatedDocument, TreeRead};
use crate::error::Result;
use crate::path::Path;
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringChangeKind {
    Insert,
    Remove,
    /// The whole text was replaced.
    Set,
}

/// One contiguous edit of a [`ReplicatedString`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringChange {
    pub kind: StringChangeKind,
    pub start: usize,
    pub end: usize,
    /// Inserted text, or for removals the text as it was before the edit.
    pub value: String,
}

pub(super) struct StringInner {
    core: AdapterCore,
    changed: Signal<StringChange>,
}

impl Adapter for StringInner {
    fn core(&self) -> &AdapterCore {
        &self.core
    }
}

impl Disposable for StringInner {
    fn dispose(&self) {
        if self.core.detach() {
            self.changed.clear();
        }
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }
}

impl StringInner {
    fn on_change(&self, change: &DocumentChange) {
        let path = self.core.path();
        for entry in change.diff.iter() {
            if entry.targets(path) {
                let event = match &entry.edit {
                    Edit::Inserted { index, content: Content::Text(text) } => StringChange {
                        kind: StringChangeKind::Insert,
                        start: *index,
                        end: index + text.len(),
                        value: text.clone(),
                    },
                    Edit::Removed { index, content: Content::Text(text) } => StringChange {
                        kind: StringChangeKind::Remove,
                        start: *index,
                        end: index + text.len(),
                        value: text.clone(),
                    },
                    _ => continue,
                };
                self.changed.emit(&event);
            } else if let Some((_, new)) = entry.replacement_of(path) {
                let value = new
                    .as_ref()
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.changed.emit(&StringChange {
                    kind: StringChangeKind::Set,
                    start: 0,
                    end: value.len(),
                    value,
                });
            }
        }
    }

    fn emit(&self, kind: StringChangeKind, start: usize, value: String) {
        self.changed.emit(&StringChange {
            kind,
            start,
            end: start + value.len(),
            value,
        });
    }
}

/// Text sequence at a path.
#[derive(Clone)]
pub struct ReplicatedString {
    inner: Rc<StringInner>,
}

impl ReplicatedString {
    pub(crate) fn new(doc: &ReplicatedDocument, path: Path) -> Self {
        let inner = Rc::new(StringInner {
            core: AdapterCore::new(doc, path),
            changed: Signal::new(),
        });
        inner.core.attach(doc, &inner, StringInner::on_change);
        Self { inner }
    }

    pub(crate) fn disposable(&self) -> Rc<dyn Disposable> {
        self.inner.clone()
    }

    pub fn path(&self) -> &Path {
        self.inner.core.path()
    }

    pub fn changed(&self) -> &Signal<StringChange> {
        &self.inner.changed
    }

    /// Current text; empty if nothing has been written yet.
    pub fn text(&self) -> Result<String> {
        let path = self.path();
        self.inner.core.read(|r| Ok(r.text(path)?.unwrap_or_default()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.text()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.text()?.is_empty())
    }

    /// Replace the whole text. Setting the current text again is a no-op.
    pub fn set_text(&self, value: &str) -> Result<()> {
        if self.text()? == value {
            return Ok(());
        }
        let value = value.to_string();
        submit(&self.inner, move |doc, inner| {
            let path = inner.core.path();
            if doc.commit_local(|m| m.text_set(path, &value).map(drop))?.is_some() {
                inner.emit(StringChangeKind::Set, 0, value);
            }
            Ok(())
        })
    }

    /// Insert `value` at byte offset `index`.
    pub fn insert(&self, index: usize, value: &str) -> Result<()> {
        check_boundary(&self.text()?, index)?;
        if value.is_empty() {
            return Ok(());
        }
        let value = value.to_string();
        submit(&self.inner, move |doc, inner| {
            let path = inner.core.path();
            if doc.commit_local(|m| m.text_insert(path, index, &value))?.is_some() {
                inner.emit(StringChangeKind::Insert, index, value);
            }
            Ok(())
        })
    }

    /// Remove bytes `start..end`. The event carries the removed text.
    pub fn remove(&self, start: usize, end: usize) -> Result<()> {
        let current = self.text()?;
        check_boundary(&current, end)?;
        check_boundary(&current, start)?;
        if start >= end {
            return Ok(());
        }
        submit(&self.inner, move |doc, inner| {
            let path = inner.core.path();
            let mut removed = String::new();
            let committed = doc.commit_local(|m| {
                removed = m.text_remove(path, start, end)?;
                Ok(())
            })?;
            if committed.is_some() {
                inner.emit(StringChangeKind::Remove, start, removed);
            }
            Ok(())
        })
    }

    pub fn clear(&self) -> Result<()> {
        let len = self.len()?;
        self.remove(0, len)
    }
}
