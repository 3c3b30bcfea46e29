//! Typed adapters over regions of the replicated tree.
//!
//! An adapter owns no data: it is a [`Path`] plus a weak back-reference to
//! the document, a change signal and the document listener it installed.
//!
//! The adapter that issued an operation builds its event from the
//! operation's own parameters once the change commits. Every other adapter
//! (a sibling on the same path, or any adapter when the change came from
//! [`ReplicatedDocument::apply_local_change`] or a remote replica)
//! translates the document [`Diff`](crate::diff::Diff): edits to its own
//! container, or a wholesale replacement of it (or of one of its ancestors).
//!
//! Every mutating call goes through the document's atomic-change API, so it
//! is parked until initialization and deferred while the gate is busy.

mod list;
mod map;
mod string;
mod value;

pub use list::{ListChange, ListChangeKind, ReplicatedList};
pub use map::{MapChange, MapChangeKind, ReplicatedMap};
pub use string::{ReplicatedString, StringChange, StringChangeKind};
pub use value::{ReplicatedValue, ValueChange};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::convert;
use crate::document::{DocInner, DocumentChange, ReplicatedDocument};
use crate::error::{CollabError, Result};
use crate::path::Path;
use crate::signal::SlotId;
use crate::Reader;

/// Element type storable in lists, maps and values.
pub trait Item: Serialize + DeserializeOwned + Clone + PartialEq + 'static {}

impl<T> Item for T where T: Serialize + DeserializeOwned + Clone + PartialEq + 'static {}

/// Equality used by `set` to detect no-op writes. Defaults to `PartialEq`.
pub(crate) type ItemCmp<T> = Rc<dyn Fn(&T, &T) -> bool>;

pub(crate) fn default_cmp<T: Item>() -> RefCell<ItemCmp<T>> {
    RefCell::new(Rc::new(|a: &T, b: &T| a == b))
}

pub(crate) struct AdapterCore {
    doc: Weak<DocInner>,
    path: Path,
    slot: Cell<Option<SlotId>>,
    disposed: Cell<bool>,
    /// Set while one of this adapter's own operations is running.
    issuing: Cell<bool>,
}

/// Clears the issuing flag when the operation returns, even on error.
struct Issuing<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl Drop for Issuing<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

impl AdapterCore {
    pub(crate) fn new(doc: &ReplicatedDocument, path: Path) -> Self {
        Self {
            doc: doc.downgrade(),
            path,
            slot: Cell::new(None),
            disposed: Cell::new(false),
            issuing: Cell::new(false),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn document(&self) -> Result<ReplicatedDocument> {
        if self.disposed.get() {
            return Err(CollabError::Disposed);
        }
        ReplicatedDocument::upgrade(&self.doc)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&Reader<'_>) -> Result<R>) -> Result<R> {
        self.document()?.read(f)?
    }

    /// Install the document listener that feeds `on_change` every change
    /// this adapter did not issue itself.
    pub(crate) fn attach<I: Adapter>(
        &self,
        doc: &ReplicatedDocument,
        target: &Rc<I>,
        on_change: fn(&I, &DocumentChange),
    ) {
        let weak = Rc::downgrade(target);
        let slot = doc.observe(move |change| {
            let Some(target) = weak.upgrade() else {
                return;
            };
            if change.is_local() && target.core().issuing.get() {
                return;
            }
            on_change(&target, change);
        });
        self.slot.set(Some(slot));
    }

    fn issue(&self) -> Issuing<'_> {
        Issuing {
            flag: &self.issuing,
            previous: self.issuing.replace(true),
        }
    }

    /// Remove the listener. Returns `false` if already detached.
    pub(crate) fn detach(&self) -> bool {
        if self.disposed.replace(true) {
            return false;
        }
        if let (Some(slot), Some(inner)) = (self.slot.take(), self.doc.upgrade()) {
            ReplicatedDocument::from_inner(inner).unobserve(slot);
        }
        true
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}

/// Shared plumbing of the adapter inners.
pub(crate) trait Adapter: 'static {
    fn core(&self) -> &AdapterCore;
}

/// Submit `op` to the adapter's document.
pub(crate) fn submit<I: Adapter>(
    inner: &Rc<I>,
    op: impl FnOnce(&ReplicatedDocument, &I) -> Result<()> + 'static,
) -> Result<()> {
    let doc = inner.core().document()?;
    let target = inner.clone();
    doc.submit(Box::new(move |doc| {
        let _issuing = target.core().issue();
        op(doc, &target)
    }))
}

/// Decode an optional JSON value, logging values of the wrong shape.
pub(crate) fn decode_opt<T: DeserializeOwned>(value: Option<Value>) -> Option<T> {
    let value = value?;
    match convert::from_json(value) {
        Ok(item) => Some(item),
        Err(e) => {
            log::warn!("ignoring value of unexpected shape: {e}");
            None
        }
    }
}
