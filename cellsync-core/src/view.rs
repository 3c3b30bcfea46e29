//! Scoped addressing contexts and the adapter factories.
//!
//! A [`DocumentView`] prefixes every path with its base. It copies no data;
//! it owns the adapters and sub-views created through it and disposes them
//! when it is disposed (or when the document is).

use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::document::{DisposableSet, DocInner, Disposable, ReplicatedDocument};
use crate::error::{CollabError, Result};
use crate::path::Path;
use crate::primitives::{Item, ReplicatedList, ReplicatedMap, ReplicatedString, ReplicatedValue};

struct ViewInner {
    doc: Weak<DocInner>,
    base: Path,
    children: DisposableSet,
    disposed: Cell<bool>,
}

impl Disposable for ViewInner {
    fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        log::trace!("disposing view {}", self.base);
        self.children.dispose_all();
    }

    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
}

/// Addressing context rooted at a base path.
#[derive(Clone)]
pub struct DocumentView {
    inner: Rc<ViewInner>,
}

impl DocumentView {
    /// A top-level view owned by the document.
    pub(crate) fn new(doc: &ReplicatedDocument, base: Path) -> Self {
        let view = Self::detached(doc, base);
        doc.register(view.inner.clone());
        view
    }

    fn detached(doc: &ReplicatedDocument, base: Path) -> Self {
        Self {
            inner: Rc::new(ViewInner {
                doc: doc.downgrade(),
                base,
                children: DisposableSet::default(),
                disposed: Cell::new(false),
            }),
        }
    }

    pub fn base(&self) -> &Path {
        &self.inner.base
    }

    /// Full path of `path` relative to this view.
    pub fn resolve(&self, path: impl Into<Path>) -> Path {
        Path::resolve(&self.inner.base, &path.into())
    }

    pub fn document(&self) -> Result<ReplicatedDocument> {
        if self.inner.disposed.get() {
            return Err(CollabError::Disposed);
        }
        ReplicatedDocument::upgrade(&self.inner.doc)
    }

    /// A nested view, owned and disposed by this one.
    pub fn view(&self, sub_path: impl Into<Path>) -> Result<DocumentView> {
        let doc = self.document()?;
        let child = Self::detached(&doc, self.resolve(sub_path));
        self.inner.children.add(child.inner.clone());
        Ok(child)
    }

    pub fn create_string(&self, path: impl Into<Path>) -> Result<ReplicatedString> {
        let doc = self.document()?;
        let adapter = ReplicatedString::new(&doc, self.resolve(path));
        self.inner.children.add(adapter.disposable());
        Ok(adapter)
    }

    pub fn create_list<T: Item>(&self, path: impl Into<Path>) -> Result<ReplicatedList<T>> {
        let doc = self.document()?;
        let adapter = ReplicatedList::new(&doc, self.resolve(path));
        self.inner.children.add(adapter.disposable());
        Ok(adapter)
    }

    pub fn create_map<T: Item>(&self, path: impl Into<Path>) -> Result<ReplicatedMap<T>> {
        let doc = self.document()?;
        let adapter = ReplicatedMap::new(&doc, self.resolve(path));
        self.inner.children.add(adapter.disposable());
        Ok(adapter)
    }

    pub fn create_value<T: Item>(&self, path: impl Into<Path>) -> Result<ReplicatedValue<T>> {
        let doc = self.document()?;
        let adapter = ReplicatedValue::new(&doc, self.resolve(path));
        self.inner.children.add(adapter.disposable());
        Ok(adapter)
    }

    /// Take ownership of an externally created resource.
    pub(crate) fn adopt(&self, item: Rc<dyn Disposable>) {
        self.inner.children.add(item);
    }

    /// Number of live adapters and sub-views owned by this view.
    pub fn owned_len(&self) -> usize {
        self.inner.children.len()
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }
}
