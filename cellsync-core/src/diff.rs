//! Structural diffs.
//!
//! Observer callbacks only record what changed ([`RawEvent`]). Once the
//! transaction has committed, one dedicated translation step turns those
//! records into a tagged [`Diff`]. Removed content is not carried by the
//! events, so the translator keeps a JSON shadow of the whole tree in step
//! with every transaction and reads old values out of it:
//!
//! ```text
//!   TransactionMut::commit
//!        │ observe_deep(events) ──▶ capture ──▶ Vec<RawEvent>
//!        ▼
//!   translate(txn, raw, shadow) ──▶ Vec<DiffEntry> ──▶ DocumentChange
//!        │
//!        ├── shadow updated in place (maps, arrays, strings)
//!        └── links reached ──▶ containers to observe next
//! ```
//!
//! A container linked in during the transaction is reported once, as the
//! new value of its parent entry, read from the committed state; edits
//! recorded below it in the same transaction are folded into that value.
//!
//! Entries are ordered parent-first. Edits inside one container appear in
//! increasing index order and each index is relative to the state left by
//! the previous edit, so replaying entries in order reproduces the change.

use serde_json::{Map as JsonMap, Value};
use yrs::types::{Change, Delta, EntryChange, Event, Events};
use yrs::{Any, MapRef, Out, ReadTxn, TransactionMut};

use crate::convert::{advance_utf16, any_to_json};
use crate::path::{self, NodeKind, Path};

/// Payload of a sequence edit.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    /// A run of text (byte length is the UTF-8 length).
    Text(String),
    /// A run of list elements.
    Values(Vec<Value>),
}

impl Content {
    pub fn len(&self) -> usize {
        match self {
            Content::Text(text) => text.len(),
            Content::Values(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One edit of one container.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Content inserted at `index` of a text or list.
    Inserted { index: usize, content: Content },
    /// Content removed from `index` of a text or list.
    Removed { index: usize, content: Content },
    /// A map entry added (`old == None`), removed (`new == None`) or replaced.
    Updated {
        key: String,
        old: Option<Value>,
        new: Option<Value>,
    },
}

/// An edit together with the path of the container it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub path: Path,
    pub edit: Edit,
}

impl DiffEntry {
    /// Whether this entry edits the container at `path` itself.
    pub fn targets(&self, path: &Path) -> bool {
        &self.path == path
    }

    /// If this entry replaces `path` or one of its ancestors wholesale, the
    /// old and new value found at `path` before and after the edit.
    pub fn replacement_of(&self, path: &Path) -> Option<(Option<Value>, Option<Value>)> {
        let segments = path.segments();
        let depth = self.path.len();
        if depth >= segments.len() || !path.starts_with(&self.path) {
            return None;
        }
        let Edit::Updated { key, old, new } = &self.edit else {
            return None;
        };
        if key != &segments[depth] {
            return None;
        }
        let rest = &segments[depth + 1..];
        let pick = |value: &Option<Value>| value.as_ref().and_then(|v| descend(v, rest)).cloned();
        Some((pick(old), pick(new)))
    }
}

fn descend<'a>(value: &'a Value, keys: &[String]) -> Option<&'a Value> {
    keys.iter().try_fold(value, |node, key| node.as_object()?.get(key))
}

/// Structural description of one applied change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn new(entries: Vec<DiffEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[DiffEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DiffEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that edit the container at `path`.
    pub fn at<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a DiffEntry> + 'a {
        self.entries.iter().filter(move |entry| entry.targets(path))
    }
}

impl<'a> IntoIterator for &'a Diff {
    type Item = &'a DiffEntry;
    type IntoIter = std::slice::Iter<'a, DiffEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// ───────────────────────────────────────────────────────────────────
// Capture
// ───────────────────────────────────────────────────────────────────

/// One step of a sequence delta. Lengths are in the container's own units
/// (elements for lists, UTF-16 code units for text).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step<T> {
    Retain(u32),
    Insert(T),
    Delete(u32),
}

/// A map entry transition as recorded by the observer. Link markers are
/// kept as-is and resolved during translation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct KeyChange {
    pub key: String,
    pub old: Option<Any>,
    pub new: Option<Any>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RawChange {
    Map(Vec<KeyChange>),
    List(Vec<Step<Vec<Value>>>),
    Text(Vec<Step<String>>),
}

/// What one observer saw of one container during a transaction.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawEvent {
    pub path: Path,
    pub change: RawChange,
}

/// Record the events delivered to the observer of the container at `path`.
pub(crate) fn capture(path: &Path, txn: &TransactionMut, events: &Events) -> Vec<RawEvent> {
    let mut raw = Vec::new();
    for event in events.iter() {
        if !event.path().is_empty() {
            log::trace!("ignoring event from a nested shared type below {path}");
            continue;
        }
        let change = match event {
            Event::Map(e) => {
                let mut keys: Vec<KeyChange> = e
                    .keys(txn)
                    .iter()
                    .map(|(key, change)| {
                        let (old, new) = match change {
                            EntryChange::Inserted(new) => (None, plain(new)),
                            EntryChange::Updated(old, new) => (plain(old), plain(new)),
                            EntryChange::Removed(old) => (plain(old), None),
                        };
                        KeyChange { key: key.to_string(), old, new }
                    })
                    .collect();
                keys.sort_by(|a, b| a.key.cmp(&b.key));
                RawChange::Map(keys)
            }
            Event::Array(e) => RawChange::List(
                e.delta(txn)
                    .iter()
                    .map(|change| match change {
                        Change::Retain(n) => Step::Retain(*n),
                        Change::Removed(n) => Step::Delete(*n),
                        Change::Added(values) => Step::Insert(
                            values
                                .iter()
                                .map(|out| plain(out).map(|any| any_to_json(&any)).unwrap_or(Value::Null))
                                .collect(),
                        ),
                    })
                    .collect(),
            ),
            Event::Text(e) => RawChange::Text(
                e.delta(txn)
                    .iter()
                    .filter_map(|delta| match delta {
                        Delta::Retain(n, _) => Some(Step::Retain(*n)),
                        Delta::Deleted(n) => Some(Step::Delete(*n)),
                        Delta::Inserted(Out::Any(Any::String(text)), _) => Some(Step::Insert(text.to_string())),
                        Delta::Inserted(..) => {
                            log::trace!("skipping embedded text content at {path}");
                            None
                        }
                    })
                    .collect(),
            ),
            _ => {
                log::trace!("ignoring non-addressable event below {path}");
                continue;
            }
        };
        raw.push(RawEvent { path: path.clone(), change });
    }
    raw
}

/// Plain value of an entry, treating `Undefined` and shared types as absent.
fn plain(out: &Out) -> Option<Any> {
    match out {
        Out::Any(Any::Undefined) => None,
        Out::Any(any) => Some(any.clone()),
        _ => None,
    }
}

// ───────────────────────────────────────────────────────────────────
// Translation
// ───────────────────────────────────────────────────────────────────

/// Result of translating one transaction.
#[derive(Debug, Default)]
pub(crate) struct Translation {
    pub entries: Vec<DiffEntry>,
    /// Containers linked in by this transaction, descendants included.
    pub links: Vec<(Path, NodeKind)>,
}

/// Translate one transaction's raw events against the committed state,
/// updating `shadow` as it goes.
pub(crate) fn translate<T: ReadTxn>(txn: &T, root: &MapRef, mut raw: Vec<RawEvent>, shadow: &mut Value) -> Translation {
    // Parents first: a child's path is only valid once its parent is current.
    raw.sort_by_key(|event| event.path.len());

    let mut out = Translation::default();
    let mut refreshed: Vec<Path> = Vec::new();
    for event in raw {
        if refreshed.iter().any(|prefix| event.path.starts_with(prefix)) {
            log::trace!("{} was read whole; event folded", event.path);
            continue;
        }
        let Some(node) = shadow_node(shadow, &event.path) else {
            log::debug!("no shadow node for {}; event skipped", event.path);
            continue;
        };
        match event.change {
            RawChange::Map(keys) => {
                translate_map(txn, root, keys, node, &event.path, &mut refreshed, &mut out);
            }
            RawChange::List(steps) => translate_array(steps, node, &event.path, &mut out.entries),
            RawChange::Text(steps) => translate_text(steps, node, &event.path, &mut out.entries),
        }
    }
    out
}

fn shadow_node<'a>(shadow: &'a mut Value, path: &Path) -> Option<&'a mut Value> {
    path.segments()
        .iter()
        .try_fold(shadow, |node, key| node.as_object_mut()?.get_mut(key))
}

fn translate_map<T: ReadTxn>(
    txn: &T,
    root: &MapRef,
    keys: Vec<KeyChange>,
    node: &mut Value,
    path: &Path,
    refreshed: &mut Vec<Path>,
    out: &mut Translation,
) {
    if !node.is_object() {
        *node = Value::Object(JsonMap::new());
    }
    let Some(object) = node.as_object_mut() else {
        return;
    };

    for KeyChange { key, old, new } in keys {
        let child = path.child(key.as_str());
        let new_link = new.as_ref().and_then(path::link_kind);
        if new_link.is_some() && new_link == old.as_ref().and_then(path::link_kind) {
            // Concurrent creations of the same container write equal links.
            continue;
        }
        let new = match (new_link, new) {
            (Some(kind), _) => {
                let value = path::materialize(txn, root, &child, kind, &mut out.links);
                out.links.push((child.clone(), kind));
                refreshed.push(child);
                Some(value)
            }
            (None, value) => value.as_ref().map(any_to_json),
        };
        let old = match &new {
            Some(value) => object.insert(key.clone(), value.clone()),
            None => object.remove(&key),
        };
        if old.is_none() && new.is_none() {
            continue;
        }
        out.entries.push(DiffEntry {
            path: path.clone(),
            edit: Edit::Updated { key, old, new },
        });
    }
}

fn translate_array(steps: Vec<Step<Vec<Value>>>, node: &mut Value, path: &Path, entries: &mut Vec<DiffEntry>) {
    if !node.is_array() {
        *node = Value::Array(Vec::new());
    }
    let Some(items) = node.as_array_mut() else {
        return;
    };
    let mut cursor = 0usize;
    for step in steps {
        match step {
            Step::Retain(n) => cursor += n as usize,
            Step::Insert(values) => {
                let at = cursor.min(items.len());
                items.splice(at..at, values.iter().cloned());
                cursor = at + values.len();
                entries.push(DiffEntry {
                    path: path.clone(),
                    edit: Edit::Inserted { index: at, content: Content::Values(values) },
                });
            }
            Step::Delete(n) => {
                let at = cursor.min(items.len());
                let end = (at + n as usize).min(items.len());
                let removed: Vec<Value> = items.drain(at..end).collect();
                entries.push(DiffEntry {
                    path: path.clone(),
                    edit: Edit::Removed { index: at, content: Content::Values(removed) },
                });
            }
        }
    }
}

fn translate_text(steps: Vec<Step<String>>, node: &mut Value, path: &Path, entries: &mut Vec<DiffEntry>) {
    if !node.is_string() {
        *node = Value::String(String::new());
    }
    let Value::String(text) = node else {
        return;
    };
    // Byte cursor into `text`; step lengths are UTF-16 units.
    let mut cursor = 0usize;
    for step in steps {
        match step {
            Step::Retain(n) => cursor = advance_utf16(text, cursor, n),
            Step::Insert(inserted) => {
                text.insert_str(cursor, &inserted);
                let len = inserted.len();
                entries.push(DiffEntry {
                    path: path.clone(),
                    edit: Edit::Inserted { index: cursor, content: Content::Text(inserted) },
                });
                cursor += len;
            }
            Step::Delete(n) => {
                let end = advance_utf16(text, cursor, n);
                let removed: String = text.drain(cursor..end).collect();
                entries.push(DiffEntry {
                    path: path.clone(),
                    edit: Edit::Removed { index: cursor, content: Content::Text(removed) },
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use yrs::{Doc, Transact};

    fn entry(path: &[&str], edit: Edit) -> DiffEntry {
        DiffEntry { path: Path::new(path.iter().copied()), edit }
    }

    #[test]
    fn test_targets_exact_path_only() {
        let e = entry(
            &["nb", "source"],
            Edit::Inserted { index: 0, content: Content::Text("x".into()) },
        );
        assert!(e.targets(&Path::from(["nb", "source"])));
        assert!(!e.targets(&Path::from(["nb"])));
        assert!(!e.targets(&Path::from(["nb", "source", "deeper"])));
    }

    #[test]
    fn test_replacement_of_descendant() {
        let e = entry(
            &["nb"],
            Edit::Updated {
                key: "meta".into(),
                old: Some(json!({"kernel": {"name": "py"}})),
                new: Some(json!({"kernel": {"name": "rs"}})),
            },
        );
        let (old, new) = e.replacement_of(&Path::from(["nb", "meta", "kernel", "name"])).unwrap();
        assert_eq!(old, Some(json!("py")));
        assert_eq!(new, Some(json!("rs")));
        assert!(e.replacement_of(&Path::from(["nb"])).is_none());
        assert!(e.replacement_of(&Path::from(["nb", "other"])).is_none());
    }

    #[test]
    fn test_content_len() {
        assert_eq!(Content::Text("héllo".into()).len(), 6);
        assert_eq!(Content::Values(vec![json!(1), json!(2)]).len(), 2);
        assert!(Content::Values(vec![]).is_empty());
    }

    fn text_event(path: &[&str], steps: Vec<Step<String>>) -> RawEvent {
        RawEvent { path: Path::new(path.iter().copied()), change: RawChange::Text(steps) }
    }

    #[test]
    fn test_translate_text_tracks_shadow() {
        let doc = Doc::new();
        let root = doc.get_or_insert_map(path::ROOT_NAME);
        let txn = doc.transact();
        let mut shadow = json!({"nb": {"source": "héllo"}});

        let raw = vec![text_event(
            &["nb", "source"],
            vec![Step::Retain(1), Step::Delete(1), Step::Insert("e".into())],
        )];
        let out = translate(&txn, &root, raw, &mut shadow);
        assert_eq!(shadow, json!({"nb": {"source": "hello"}}));
        assert_eq!(
            out.entries.iter().map(|e| e.edit.clone()).collect::<Vec<_>>(),
            vec![
                Edit::Removed { index: 1, content: Content::Text("é".into()) },
                Edit::Inserted { index: 1, content: Content::Text("e".into()) },
            ]
        );
    }

    #[test]
    fn test_events_below_unknown_nodes_are_skipped() {
        let doc = Doc::new();
        let root = doc.get_or_insert_map(path::ROOT_NAME);
        let txn = doc.transact();
        let mut shadow = json!({});
        let raw = vec![text_event(&["gone", "source"], vec![Step::Insert("x".into())])];
        let out = translate(&txn, &root, raw, &mut shadow);
        assert!(out.entries.is_empty());
        assert_eq!(shadow, json!({}));
    }

    #[test]
    fn test_equal_links_are_not_reported() {
        let doc = Doc::new();
        let root = doc.get_or_insert_map(path::ROOT_NAME);
        let txn = doc.transact();
        let mut shadow = json!({"nb": {}});
        let raw = vec![RawEvent {
            path: Path::root(),
            change: RawChange::Map(vec![KeyChange {
                key: "nb".into(),
                old: Some(path::link(NodeKind::Map)),
                new: Some(path::link(NodeKind::Map)),
            }]),
        }];
        let out = translate(&txn, &root, raw, &mut shadow);
        assert!(out.entries.is_empty());
        assert!(out.links.is_empty());
    }
}
