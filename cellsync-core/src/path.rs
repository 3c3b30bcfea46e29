//! Hierarchical addressing into the replicated tree.
//!
//! A [`Path`] is an ordered list of opaque string segments, e.g.
//! `[notebook_id, "cells", cell_id, "source"]`. Every intermediate segment
//! names a map; the last segment names the addressed node, which may be a
//! map, a list, a text sequence or a plain value entry.
//!
//! Containers are not nested inside one another. Each one is a top-level
//! shared type whose name is derived from its kind and path, and the parent
//! map only holds a small link marker under the child's key:
//!
//! ```text
//! cellsync                                  { nb: <map> }
//! cellsync/map["nb"]                        { cells: <map>, title: "Notes" }
//! cellsync/map["nb","cells"]                { c1: <map> }
//! cellsync/text["nb","cells","c1","source"] "print(1)"
//! ```
//!
//! Two replicas creating the same container concurrently therefore write
//! the same name and identical markers, and their contents merge instead of
//! one creation replacing the other. Segments are encoded as a JSON array,
//! so two distinct entities never collide no matter what their ids contain.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use std::fmt;
use std::sync::Arc;
use yrs::{Any, Array, ArrayRef, GetString, Map, MapRef, Out, ReadTxn, Text, TextRef, TransactionMut, WriteTxn};

use crate::convert::any_to_json;
use crate::error::{CollabError, Result};

/// Name of the shared root map every path resolves below.
pub const ROOT_NAME: &str = "cellsync";

/// First byte of a link marker. JSON values are never stored as buffers,
/// so a marker cannot be mistaken for user data.
const LINK_TAG: u8 = 0xC5;

/// Ordered sequence of segments identifying a location in the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(Vec<String>);

impl Path {
    /// The empty path, addressing the root map itself.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Resolve `path` relative to `base`.
    ///
    /// Plain segment concatenation: deterministic and collision-free.
    pub fn resolve(base: &Path, path: &Path) -> Path {
        base.join(path)
    }

    pub fn join(&self, other: &Path) -> Path {
        let mut segments = Vec::with_capacity(self.0.len() + other.0.len());
        segments.extend(self.0.iter().cloned());
        segments.extend(other.0.iter().cloned());
        Path(segments)
    }

    /// A new path with one more segment.
    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }

    pub fn parent(&self) -> Option<Path> {
        if self.0.is_empty() {
            return None;
        }
        Some(Path(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn starts_with(&self, prefix: &Path) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Segments remaining after `prefix`, if `prefix` is an ancestor (or equal).
    pub fn strip_prefix(&self, prefix: &Path) -> Option<&[String]> {
        if self.starts_with(prefix) {
            Some(&self.0[prefix.0.len()..])
        } else {
            None
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl From<&str> for Path {
    fn from(segment: &str) -> Self {
        Path(vec![segment.to_string()])
    }
}

impl From<Vec<String>> for Path {
    fn from(segments: Vec<String>) -> Self {
        Path(segments)
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for Path {
    fn from(segments: [S; N]) -> Self {
        Path::new(segments)
    }
}

impl<S: Into<String>> FromIterator<S> for Path {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Path::new(iter)
    }
}

// ───────────────────────────────────────────────────────────────────
// Node kinds
// ───────────────────────────────────────────────────────────────────

/// Kind of node stored at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Map,
    List,
    Text,
    /// A plain (non-shared) value entry.
    Value,
    /// Anything the core does not address (nested shared types, xml, sub-documents).
    Other,
}

impl NodeKind {
    /// Kind of a raw map entry; link markers report the container they point at.
    pub(crate) fn of(out: &Out) -> NodeKind {
        match out {
            Out::Any(any) => link_kind(any).unwrap_or(NodeKind::Value),
            _ => NodeKind::Other,
        }
    }

    pub fn is_container(self) -> bool {
        matches!(self, NodeKind::Map | NodeKind::List | NodeKind::Text)
    }

    fn code(self) -> u8 {
        match self {
            NodeKind::Map => 1,
            NodeKind::List => 2,
            NodeKind::Text => 3,
            NodeKind::Value | NodeKind::Other => 0,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeKind::Map => "map",
            NodeKind::List => "list",
            NodeKind::Text => "text",
            NodeKind::Value => "value",
            NodeKind::Other => "foreign node",
        };
        f.write_str(name)
    }
}

/// Marker stored in a parent map under the key of a child container.
pub(crate) fn link(kind: NodeKind) -> Any {
    Any::Buffer(Arc::from([LINK_TAG, kind.code()].as_slice()))
}

/// Container kind a marker points at; `None` for ordinary values.
pub(crate) fn link_kind(any: &Any) -> Option<NodeKind> {
    let Any::Buffer(bytes) = any else {
        return None;
    };
    match &bytes[..] {
        [LINK_TAG, 1] => Some(NodeKind::Map),
        [LINK_TAG, 2] => Some(NodeKind::List),
        [LINK_TAG, 3] => Some(NodeKind::Text),
        _ => None,
    }
}

/// Name of the top-level shared type backing the container of `kind` at `path`.
pub(crate) fn type_name(path: &Path, kind: NodeKind) -> String {
    if path.is_root() {
        return ROOT_NAME.to_string();
    }
    let segments = Value::from(path.0.clone());
    format!("{ROOT_NAME}/{kind}{segments}")
}

/// Handle to a shared container resolved from a path.
#[derive(Debug, Clone)]
pub enum Node {
    Map(MapRef),
    List(ArrayRef),
    Text(TextRef),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Map(_) => NodeKind::Map,
            Node::List(_) => NodeKind::List,
            Node::Text(_) => NodeKind::Text,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Resolution
// ───────────────────────────────────────────────────────────────────

/// The shared type behind a container, if this replica has seen it.
///
/// A linked container may lack a backing type when it was created empty
/// elsewhere; readers treat it as empty.
fn branch<T: ReadTxn>(txn: &T, root: &MapRef, path: &Path, kind: NodeKind) -> Option<Node> {
    if path.is_root() {
        return (kind == NodeKind::Map).then(|| Node::Map(root.clone()));
    }
    let name = type_name(path, kind);
    match kind {
        NodeKind::Map => txn.get_map(name).map(Node::Map),
        NodeKind::List => txn.get_array(name).map(Node::List),
        NodeKind::Text => txn.get_text(name).map(Node::Text),
        NodeKind::Value | NodeKind::Other => None,
    }
}

/// Walk the map chain above `path` and return the map holding its last segment.
///
/// `Ok(None)` when an intermediate map does not exist yet.
fn parent_map<T: ReadTxn>(txn: &T, root: &MapRef, path: &Path) -> Result<Option<MapRef>> {
    let segments = path.segments();
    let mut current = root.clone();
    for depth in 0..segments.len().saturating_sub(1) {
        let prefix = Path::new(segments[..=depth].iter().cloned());
        let found = match current.get(txn, &segments[depth]) {
            None => return Ok(None),
            Some(out) => NodeKind::of(&out),
        };
        if found != NodeKind::Map {
            return Err(CollabError::PathTypeConflict {
                path: prefix,
                expected: NodeKind::Map,
                found,
            });
        }
        current = match branch(txn, root, &prefix, NodeKind::Map) {
            Some(Node::Map(map)) => map,
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}

/// Raw entry stored at `path` in its parent map. `None` for the root.
fn lookup<T: ReadTxn>(txn: &T, root: &MapRef, path: &Path) -> Result<Option<Out>> {
    let Some(last) = path.last() else {
        return Ok(None);
    };
    match parent_map(txn, root, path)? {
        Some(parent) => Ok(parent.get(txn, last)),
        None => Ok(None),
    }
}

/// Kind of the node at `path`, if any.
pub(crate) fn kind_at<T: ReadTxn>(txn: &T, root: &MapRef, path: &Path) -> Result<Option<NodeKind>> {
    if path.is_root() {
        return Ok(Some(NodeKind::Map));
    }
    Ok(lookup(txn, root, path)?.map(|out| NodeKind::of(&out)))
}

/// JSON value of the node at `path`, following links.
pub(crate) fn value_at<T: ReadTxn>(txn: &T, root: &MapRef, path: &Path) -> Result<Option<Value>> {
    if path.is_root() {
        return Ok(Some(materialize(txn, root, path, NodeKind::Map, &mut Vec::new())));
    }
    Ok(lookup(txn, root, path)?.map(|out| entry_json(txn, root, path, &out, &mut Vec::new())))
}

/// JSON for a raw map entry found at `path`. Every link followed is appended to `links`.
pub(crate) fn entry_json<T: ReadTxn>(
    txn: &T,
    root: &MapRef,
    path: &Path,
    out: &Out,
    links: &mut Vec<(Path, NodeKind)>,
) -> Value {
    match out {
        Out::Any(any) => match link_kind(any) {
            Some(kind) => {
                links.push((path.clone(), kind));
                materialize(txn, root, path, kind, links)
            }
            None => any_to_json(any),
        },
        _ => Value::Null,
    }
}

/// Current JSON content of the container of `kind` at `path`.
///
/// Links found on the way are appended to `links`, descendants included.
pub(crate) fn materialize<T: ReadTxn>(
    txn: &T,
    root: &MapRef,
    path: &Path,
    kind: NodeKind,
    links: &mut Vec<(Path, NodeKind)>,
) -> Value {
    match branch(txn, root, path, kind) {
        Some(Node::Map(map)) => {
            let mut object = JsonMap::new();
            for (key, out) in map.iter(txn) {
                if matches!(out, Out::Any(Any::Undefined)) {
                    continue;
                }
                let value = entry_json(txn, root, &path.child(key), &out, links);
                object.insert(key.to_string(), value);
            }
            Value::Object(object)
        }
        Some(Node::List(list)) => Value::Array(
            list.iter(txn)
                .map(|out| match out {
                    Out::Any(any) => any_to_json(&any),
                    _ => Value::Null,
                })
                .collect(),
        ),
        Some(Node::Text(text)) => Value::String(text.get_string(txn)),
        None => match kind {
            NodeKind::List => Value::Array(Vec::new()),
            NodeKind::Text => Value::String(String::new()),
            _ => Value::Object(JsonMap::new()),
        },
    }
}

/// Resolve an existing container of the given kind without creating anything.
pub(crate) fn resolve_container<T: ReadTxn>(
    txn: &T,
    root: &MapRef,
    path: &Path,
    kind: NodeKind,
) -> Result<Option<Node>> {
    let Some(found) = kind_at(txn, root, path)? else {
        return Ok(None);
    };
    if found != kind {
        return Err(CollabError::PathTypeConflict {
            path: path.clone(),
            expected: kind,
            found,
        });
    }
    Ok(branch(txn, root, path, kind))
}

/// Check that every ancestor of `path` is (or may become) a map and that
/// `path` itself is free or already holds a `kind`.
fn check_compatible<T: ReadTxn>(txn: &T, root: &MapRef, path: &Path, kind: NodeKind) -> Result<()> {
    if path.is_root() {
        if kind == NodeKind::Map {
            return Ok(());
        }
        return Err(CollabError::PathTypeConflict {
            path: path.clone(),
            expected: kind,
            found: NodeKind::Map,
        });
    }
    match kind_at(txn, root, path)? {
        Some(found) if found != kind => Err(CollabError::PathTypeConflict {
            path: path.clone(),
            expected: kind,
            found,
        }),
        _ => Ok(()),
    }
}

/// Write the links leading to the container of `kind` at `path`.
///
/// Validation happens before anything is written, so a conflicting call
/// leaves the tree untouched. Returns whether a link was written.
fn link_chain(txn: &mut TransactionMut, root: &MapRef, path: &Path, kind: NodeKind) -> Result<bool> {
    if !kind.is_container() {
        return Err(CollabError::InvalidValue(format!("{kind} is not a container")));
    }
    check_compatible(&*txn, root, path, kind)?;

    let segments = path.segments();
    let mut parent = root.clone();
    let mut wrote = false;
    for depth in 0..segments.len() {
        let prefix = Path::new(segments[..=depth].iter().cloned());
        let expected = if depth + 1 == segments.len() { kind } else { NodeKind::Map };
        let key = segments[depth].as_str();
        if parent.get(&*txn, key).is_none() {
            log::trace!("linking {expected} at {prefix}");
            parent.insert(txn, key, link(expected));
            wrote = true;
        }
        if expected == NodeKind::Map {
            parent = txn.get_or_insert_map(type_name(&prefix, NodeKind::Map));
        }
    }
    Ok(wrote)
}

/// Create the map at `path` (and any missing ancestors) on first use.
///
/// Returns the map and whether anything was written.
pub(crate) fn ensure_map(txn: &mut TransactionMut, root: &MapRef, path: &Path) -> Result<(MapRef, bool)> {
    if path.is_root() {
        return Ok((root.clone(), false));
    }
    let wrote = link_chain(txn, root, path, NodeKind::Map)?;
    Ok((txn.get_or_insert_map(type_name(path, NodeKind::Map)), wrote))
}

pub(crate) fn ensure_list(txn: &mut TransactionMut, root: &MapRef, path: &Path) -> Result<(ArrayRef, bool)> {
    let wrote = link_chain(txn, root, path, NodeKind::List)?;
    Ok((txn.get_or_insert_array(type_name(path, NodeKind::List)), wrote))
}

pub(crate) fn ensure_text(txn: &mut TransactionMut, root: &MapRef, path: &Path) -> Result<(TextRef, bool)> {
    let wrote = link_chain(txn, root, path, NodeKind::Text)?;
    Ok((txn.get_or_insert_text(type_name(path, NodeKind::Text)), wrote))
}

/// Create the container at `path` (and any missing intermediate maps) on first use.
pub(crate) fn ensure_container(
    txn: &mut TransactionMut,
    root: &MapRef,
    path: &Path,
    kind: NodeKind,
) -> Result<(Node, bool)> {
    match kind {
        NodeKind::Map => ensure_map(txn, root, path).map(|(map, wrote)| (Node::Map(map), wrote)),
        NodeKind::List => ensure_list(txn, root, path).map(|(list, wrote)| (Node::List(list), wrote)),
        NodeKind::Text => ensure_text(txn, root, path).map(|(text, wrote)| (Node::Text(text), wrote)),
        NodeKind::Value | NodeKind::Other => {
            Err(CollabError::InvalidValue(format!("{kind} is not a container")))
        }
    }
}

/// Store a plain value entry at `path`, creating parent maps as needed.
pub(crate) fn set_entry(txn: &mut TransactionMut, root: &MapRef, path: &Path, value: Any) -> Result<()> {
    let Some(key) = path.last() else {
        return Err(CollabError::InvalidValue("cannot replace the root map".into()));
    };
    check_compatible(&*txn, root, path, NodeKind::Value)?;
    let parent_path = path.parent().unwrap_or_default();
    let (parent, _) = ensure_map(txn, root, &parent_path)?;
    parent.insert(txn, key, value);
    Ok(())
}

/// Remove the entry at `path`. Returns whether something was removed.
///
/// A removed container is emptied too (descendants included), so creating
/// it again later starts from scratch.
pub(crate) fn remove_entry(txn: &mut TransactionMut, root: &MapRef, path: &Path) -> Result<bool> {
    let Some(key) = path.last() else {
        return Err(CollabError::InvalidValue("cannot remove the root map".into()));
    };
    let Some(parent) = parent_map(&*txn, root, path)? else {
        return Ok(false);
    };
    let Some(out) = parent.get(&*txn, key) else {
        return Ok(false);
    };
    if let Out::Any(any) = &out {
        if let Some(kind) = link_kind(any) {
            clear(txn, root, path, kind);
        }
    }
    parent.remove(txn, key);
    Ok(true)
}

fn clear(txn: &mut TransactionMut, root: &MapRef, path: &Path, kind: NodeKind) {
    match branch(&*txn, root, path, kind) {
        Some(Node::Map(map)) => {
            let entries: Vec<(String, Option<NodeKind>)> = map
                .iter(&*txn)
                .map(|(key, out)| {
                    let linked = match &out {
                        Out::Any(any) => link_kind(any),
                        _ => None,
                    };
                    (key.to_string(), linked)
                })
                .collect();
            for (key, linked) in entries {
                if let Some(child) = linked {
                    clear(txn, root, &path.child(key.as_str()), child);
                }
                map.remove(txn, &key);
            }
        }
        Some(Node::List(list)) => {
            let len = list.len(&*txn);
            if len > 0 {
                list.remove_range(txn, 0, len);
            }
        }
        Some(Node::Text(text)) => {
            let len = text.len(&*txn);
            if len > 0 {
                text.remove_range(txn, 0, len);
            }
        }
        None => {}
    }
}
