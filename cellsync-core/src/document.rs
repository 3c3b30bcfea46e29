//! The replicated document.
//!
//! ```text
//!   adapters / views ──submit──▶ ReplicatedDocument ──▶ Outbox ──▶ SyncChannel
//!                                   │   ▲
//!                 TransactionMut    │   │ merge_remote / merge_update
//!                                   ▼   │
//!                          yrs Doc ─observe_deep─▶ diff::capture
//!                                                        │ after commit
//!                                                        ▼
//!                                      diff::translate ─▶ listeners
//! ```
//!
//! Every local change runs inside one write transaction and produces one
//! encoded fragment. Each container in the tree is observed separately; a
//! container linked in by a transaction is observed from the moment that
//! transaction has been translated. Remote change-sets are decoded, applied in a single
//! transaction, translated into a [`Diff`] and delivered to listeners with
//! the before/after state vectors.
//!
//! The document is single-threaded (`!Send`). While a change and its
//! notifications are in flight the [`MutualExclusionGate`] is held; work
//! submitted in that window is queued and replayed in order afterwards.
//! Mutations submitted before initialization are parked in a separate FIFO
//! that drains once [`ReplicatedDocument::mark_initialized`] is called.
//!
//! Reference: Nicolaescu et al., "Near Real-Time Peer-to-Peer Shared Editing
//! on Extensible Data Types" (YATA), GROUP 2016.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use tokio::sync::Notify;
use yrs::updates::decoder::Decode;
use yrs::{
    Array, DeepObservable, Doc, GetString, Map, MapRef, OffsetKind, Options, ReadTxn, StateVector, Subscription,
    Text, Transact, TransactionMut, Update, WriteTxn,
};

use crate::changeset::{ActorId, ChangeSet};
use crate::convert::{self, any_to_json, check_boundary, json_to_any, utf16_offset};
use crate::diff::{self, Diff, DiffEntry, RawEvent};
use crate::error::{CollabError, Result};
use crate::gate::{MutualExclusionGate, TaskQueue};
use crate::path::{self, Node, NodeKind, Path, ROOT_NAME};
use crate::registry::{Collaborator, CollaboratorRegistry};
use crate::signal::{Signal, SlotId};
use crate::view::DocumentView;

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

/// Per-document configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// Session identity; a fresh v4 id unless given.
    pub actor: ActorId,
    pub user_id: String,
    pub display_name: String,
    /// Park mutations until the first remote state sync completes.
    pub await_initial_sync: bool,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            actor: ActorId::new(),
            user_id: "anonymous".to_string(),
            display_name: "Anonymous".to_string(),
            await_initial_sync: false,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Change notifications
// ───────────────────────────────────────────────────────────────────

/// Where an applied change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote(ActorId),
    /// An initial-state snapshot from the relay.
    Snapshot,
}

/// Delivered to [`ReplicatedDocument::observe`] listeners once per applied change.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub diff: Diff,
    /// Causal marker before the change.
    pub before: StateVector,
    /// Causal marker after the change.
    pub after: StateVector,
    pub origin: Origin,
}

impl DocumentChange {
    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}

// ───────────────────────────────────────────────────────────────────
// Disposal
// ───────────────────────────────────────────────────────────────────

/// Resources owned by a document or view and torn down with it.
pub trait Disposable {
    fn dispose(&self);
    fn is_disposed(&self) -> bool;
}

#[derive(Default)]
pub(crate) struct DisposableSet {
    items: RefCell<Vec<Rc<dyn Disposable>>>,
}

impl DisposableSet {
    pub(crate) fn add(&self, item: Rc<dyn Disposable>) {
        let mut items = self.items.borrow_mut();
        items.retain(|existing| !existing.is_disposed());
        items.push(item);
    }

    pub(crate) fn dispose_all(&self) {
        let items = std::mem::take(&mut *self.items.borrow_mut());
        for item in items {
            item.dispose();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.borrow().iter().filter(|item| !item.is_disposed()).count()
    }
}

// ───────────────────────────────────────────────────────────────────
// Document
// ───────────────────────────────────────────────────────────────────

pub(crate) type DocOp = Box<dyn FnOnce(&ReplicatedDocument) -> Result<()>>;
type InitTask = Box<dyn FnOnce(&ReplicatedDocument)>;

struct OpenBatch {
    seq: u64,
    fragments: Vec<Vec<u8>>,
}

#[derive(Default)]
struct Outbox {
    queue: RefCell<VecDeque<ChangeSet>>,
    notify: Rc<Notify>,
}

impl Outbox {
    fn push(&self, change_set: ChangeSet) {
        self.queue.borrow_mut().push_back(change_set);
        self.notify.notify_one();
    }
}

type RawLog = Rc<RefCell<Vec<RawEvent>>>;

pub(crate) struct DocInner {
    config: DocumentConfig,
    doc: Doc,
    root: MapRef,
    /// Events recorded by the observers during the open transaction.
    raw: RawLog,
    /// JSON image of the tree as of the last translated transaction.
    shadow: RefCell<Value>,
    /// One observer per container, keyed by shared type name.
    watched: RefCell<HashMap<String, Subscription>>,
    gate: MutualExclusionGate,
    deferred: TaskQueue<DocOp>,
    waiting: TaskQueue<InitTask>,
    in_txn: Cell<bool>,
    initialized: Cell<bool>,
    disposed: Cell<bool>,
    seq: Cell<u64>,
    seen: RefCell<HashMap<ActorId, u64>>,
    batch: RefCell<Option<OpenBatch>>,
    outbox: Outbox,
    listeners: Signal<DocumentChange>,
    registry: CollaboratorRegistry,
    disposables: DisposableSet,
}

impl DocInner {
    fn ensure_live(&self) -> Result<()> {
        if self.disposed.get() {
            return Err(CollabError::Disposed);
        }
        Ok(())
    }
}

/// Handle to one replicated document. Cloning shares the same document.
#[derive(Clone)]
pub struct ReplicatedDocument {
    inner: Rc<DocInner>,
}

impl fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("actor", &self.inner.config.actor)
            .field("initialized", &self.inner.initialized.get())
            .field("disposed", &self.inner.disposed.get())
            .finish()
    }
}

impl ReplicatedDocument {
    pub fn new(config: DocumentConfig) -> Self {
        let mut options = Options::with_client_id(config.actor.client_id());
        options.offset_kind = OffsetKind::Utf16;
        let doc = Doc::with_options(options);
        let root = doc.get_or_insert_map(ROOT_NAME);

        let raw: RawLog = Rc::new(RefCell::new(Vec::new()));
        let mut watched = HashMap::new();
        watched.insert(ROOT_NAME.to_string(), observe_container(&root, Path::root(), &raw));

        let local = Collaborator::new(config.user_id.clone(), config.actor, config.display_name.clone());
        let initialized = !config.await_initial_sync;
        log::info!(
            "opened document for actor {} (client id {})",
            config.actor,
            config.actor.client_id()
        );

        Self {
            inner: Rc::new(DocInner {
                doc,
                root,
                raw,
                shadow: RefCell::new(Value::Object(JsonMap::new())),
                watched: RefCell::new(watched),
                gate: MutualExclusionGate::new(),
                deferred: TaskQueue::new(),
                waiting: TaskQueue::new(),
                in_txn: Cell::new(false),
                initialized: Cell::new(initialized),
                disposed: Cell::new(false),
                seq: Cell::new(0),
                seen: RefCell::new(HashMap::new()),
                batch: RefCell::new(None),
                outbox: Outbox::default(),
                listeners: Signal::new(),
                registry: CollaboratorRegistry::new(local),
                disposables: DisposableSet::default(),
                config,
            }),
        }
    }

    pub fn actor(&self) -> ActorId {
        self.inner.config.actor
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &CollaboratorRegistry {
        &self.inner.registry
    }

    pub fn gate(&self) -> &MutualExclusionGate {
        &self.inner.gate
    }

    /// Number of mutations waiting for the gate or for initialization.
    pub fn queued_len(&self) -> usize {
        self.inner.deferred.len() + self.inner.waiting.len()
    }

    // ── local changes ───────────────────────────────────────────────

    /// Run `mutator` as one atomic local change.
    ///
    /// Returns the produced change-set, or `None` if the mutator wrote
    /// nothing or the change was queued (the gate is busy or the document is
    /// not initialized yet). Fails with [`CollabError::ConcurrentMutation`]
    /// when called from inside another mutator of this document.
    pub fn apply_local_change<F>(&self, mutator: F) -> Result<Option<ChangeSet>>
    where
        F: FnOnce(&mut Mutation<'_>) -> Result<()> + 'static,
    {
        let inner = &self.inner;
        inner.ensure_live()?;
        if inner.in_txn.get() {
            return Err(CollabError::ConcurrentMutation);
        }
        if !inner.initialized.get() || inner.gate.is_locked() {
            self.submit(Box::new(move |doc| doc.commit_local(mutator).map(drop)))?;
            return Ok(None);
        }
        self.exclusive(|| self.commit_local(mutator))
    }

    /// Group every local change made by `f` into a single outbound change-set.
    pub fn batch<R>(&self, f: impl FnOnce(&ReplicatedDocument) -> R) -> Result<R> {
        let inner = &self.inner;
        inner.ensure_live()?;
        if inner.batch.borrow().is_some() {
            return Ok(f(self));
        }
        let seq = self.next_seq();
        *inner.batch.borrow_mut() = Some(OpenBatch { seq, fragments: Vec::new() });
        let result = f(self);
        let open = inner.batch.borrow_mut().take();
        if let Some(open) = open {
            if !open.fragments.is_empty() {
                log::debug!("batched {} fragments into change-set {seq}", open.fragments.len());
                inner.outbox.push(ChangeSet {
                    actor: self.actor(),
                    seq,
                    fragments: open.fragments,
                });
            }
        }
        Ok(result)
    }

    /// Submit a document operation, honouring the initialization gate and
    /// the reentrancy gate.
    pub(crate) fn submit(&self, op: DocOp) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_live()?;
        if inner.in_txn.get() {
            return Err(CollabError::ConcurrentMutation);
        }
        if !inner.initialized.get() {
            log::trace!("document not initialized; parking mutation");
            inner.waiting.push(Box::new(move |doc: &ReplicatedDocument| {
                if let Err(e) = doc.submit(op) {
                    log::warn!("parked mutation failed: {e}");
                }
            }));
            return Ok(());
        }
        if inner.gate.is_locked() {
            log::trace!("gate busy; deferring mutation");
            inner.deferred.push(op);
            return Ok(());
        }
        self.exclusive(|| op(self))
    }

    /// Run `f` holding the gate, then replay whatever was deferred meanwhile.
    fn exclusive<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        let result = {
            let _guard = self
                .inner
                .gate
                .acquire()
                .ok_or(CollabError::ConcurrentMutation)?;
            f()
        };
        self.drain_deferred();
        result
    }

    fn drain_deferred(&self) {
        self.inner.deferred.drain_with(|op| {
            if self.inner.disposed.get() {
                return;
            }
            if let Err(e) = self.exclusive(|| op(self)) {
                log::warn!("deferred mutation failed: {e}");
            }
        });
    }

    fn next_seq(&self) -> u64 {
        let seq = self.inner.seq.get() + 1;
        self.inner.seq.set(seq);
        seq
    }

    /// Execute one write transaction and publish it. The gate must be held.
    pub(crate) fn commit_local<F>(&self, mutator: F) -> Result<Option<ChangeSet>>
    where
        F: FnOnce(&mut Mutation<'_>) -> Result<()>,
    {
        let inner = &self.inner;
        inner.ensure_live()?;
        let before = self.state_vector()?;

        let txn = inner
            .doc
            .try_transact_mut()
            .map_err(|_| CollabError::ConcurrentMutation)?;
        inner.in_txn.set(true);
        let mut mutation = Mutation {
            txn,
            root: inner.root.clone(),
            touched: false,
        };
        let outcome = mutator(&mut mutation);
        let update = mutation.touched.then(|| mutation.txn.encode_update_v1());
        drop(mutation);
        inner.in_txn.set(false);
        let entries = self.settle().unwrap_or_else(|e| {
            log::warn!("local change left untranslated: {e}");
            Vec::new()
        });

        // Whatever reached the tree is published even if the mutator failed
        // halfway, otherwise replicas would diverge.
        let change_set = match update {
            Some(update) => Some(self.publish_local(update, before, entries)?),
            None => None,
        };
        outcome.map(|_| change_set)
    }

    fn publish_local(&self, update: Vec<u8>, before: StateVector, entries: Vec<DiffEntry>) -> Result<ChangeSet> {
        let inner = &self.inner;
        let change_set = {
            let mut batch = inner.batch.borrow_mut();
            match batch.as_mut() {
                Some(open) => {
                    open.fragments.push(update.clone());
                    ChangeSet { actor: self.actor(), seq: open.seq, fragments: vec![update] }
                }
                None => {
                    let change_set = ChangeSet {
                        actor: self.actor(),
                        seq: self.next_seq(),
                        fragments: vec![update],
                    };
                    inner.outbox.push(change_set.clone());
                    change_set
                }
            }
        };
        log::trace!("local change {} ({} bytes)", change_set.seq, change_set.payload_len());

        let change = DocumentChange {
            diff: Diff::new(entries),
            before,
            after: self.state_vector()?,
            origin: Origin::Local,
        };
        inner.listeners.emit(&change);
        Ok(change_set)
    }

    // ── remote changes ──────────────────────────────────────────────

    /// Decode and merge a remote change-set.
    pub fn merge_remote(&self, bytes: &[u8]) -> Result<Diff> {
        let change_set = ChangeSet::decode(bytes)?;
        self.merge_change_set(&change_set)
    }

    /// Merge a decoded change-set. Already-seen change-sets yield an empty diff.
    pub fn merge_change_set(&self, change_set: &ChangeSet) -> Result<Diff> {
        let inner = &self.inner;
        inner.ensure_live()?;
        if inner.in_txn.get() || inner.gate.is_locked() {
            return Err(CollabError::ConcurrentMutation);
        }
        let actor = change_set.actor;
        if actor == self.actor() {
            log::trace!("ignoring echo of own change-set {}", change_set.seq);
            return Ok(Diff::default());
        }
        inner.registry.ensure(actor);

        let last_seen = inner.seen.borrow().get(&actor).copied().unwrap_or(0);
        if change_set.seq <= last_seen {
            log::debug!("change-set {} from {actor} already applied", change_set.seq);
            return Ok(Diff::default());
        }
        let updates = change_set
            .fragments
            .iter()
            .map(|fragment| Update::decode_v1(fragment))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.exclusive(|| {
            let diff = self.apply_updates(updates, Origin::Remote(actor))?;
            inner.seen.borrow_mut().insert(actor, change_set.seq);
            Ok(diff)
        })
    }

    /// Merge a raw encoded update (e.g. an initial-state snapshot).
    pub fn merge_update(&self, bytes: &[u8], origin: Origin) -> Result<Diff> {
        let inner = &self.inner;
        inner.ensure_live()?;
        if inner.in_txn.get() || inner.gate.is_locked() {
            return Err(CollabError::ConcurrentMutation);
        }
        let update = Update::decode_v1(bytes)?;
        self.exclusive(|| self.apply_updates(vec![update], origin))
    }

    fn apply_updates(&self, updates: Vec<Update>, origin: Origin) -> Result<Diff> {
        let inner = &self.inner;
        let before = self.state_vector()?;
        let mut txn = inner
            .doc
            .try_transact_mut()
            .map_err(|_| CollabError::ConcurrentMutation)?;
        inner.in_txn.set(true);
        let mut outcome = Ok(());
        for update in updates {
            if let Err(e) = txn.apply_update(update) {
                outcome = Err(CollabError::Merge(e.to_string()));
                break;
            }
        }
        drop(txn);
        inner.in_txn.set(false);

        let diff = Diff::new(self.settle()?);
        let after = self.state_vector()?;
        if !diff.is_empty() || after != before {
            log::trace!("{origin:?} change produced {} diff entries", diff.len());
            let change = DocumentChange {
                diff: diff.clone(),
                before,
                after,
                origin,
            };
            inner.listeners.emit(&change);
        }
        outcome.map(|_| diff)
    }

    /// Translate what the last transaction recorded and start observing
    /// every container it linked in.
    fn settle(&self) -> Result<Vec<DiffEntry>> {
        let inner = &self.inner;
        let raw = inner.raw.take();
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let translation = {
            let txn = inner
                .doc
                .try_transact()
                .map_err(|_| CollabError::ConcurrentMutation)?;
            diff::translate(&txn, &inner.root, raw, &mut inner.shadow.borrow_mut())
        };
        self.watch(translation.links)?;
        Ok(translation.entries)
    }

    fn watch(&self, links: Vec<(Path, NodeKind)>) -> Result<()> {
        let inner = &self.inner;
        let mut watched = inner.watched.borrow_mut();
        for (path, kind) in links {
            let name = path::type_name(&path, kind);
            if watched.contains_key(&name) {
                continue;
            }
            let node = {
                let mut txn = inner
                    .doc
                    .try_transact_mut()
                    .map_err(|_| CollabError::ConcurrentMutation)?;
                match kind {
                    NodeKind::Map => Node::Map(txn.get_or_insert_map(name.as_str())),
                    NodeKind::List => Node::List(txn.get_or_insert_array(name.as_str())),
                    NodeKind::Text => Node::Text(txn.get_or_insert_text(name.as_str())),
                    NodeKind::Value | NodeKind::Other => continue,
                }
            };
            let subscription = match &node {
                Node::Map(map) => observe_container(map, path, &inner.raw),
                Node::List(list) => observe_container(list, path, &inner.raw),
                Node::Text(text) => observe_container(text, path, &inner.raw),
            };
            log::trace!("observing {name}");
            watched.insert(name, subscription);
        }
        Ok(())
    }

    // ── observation ─────────────────────────────────────────────────

    /// Register a listener fired synchronously once per applied change.
    pub fn observe(&self, listener: impl Fn(&DocumentChange) + 'static) -> SlotId {
        self.inner.listeners.connect(listener)
    }

    pub fn unobserve(&self, id: SlotId) -> bool {
        self.inner.listeners.disconnect(id)
    }

    // ── reading ─────────────────────────────────────────────────────

    /// Run `f` against a read-only snapshot of the tree.
    pub fn read<R>(&self, f: impl FnOnce(&Reader<'_>) -> R) -> Result<R> {
        let inner = &self.inner;
        inner.ensure_live()?;
        let txn = inner
            .doc
            .try_transact()
            .map_err(|_| CollabError::ConcurrentMutation)?;
        let reader = Reader {
            txn,
            root: inner.root.clone(),
        };
        Ok(f(&reader))
    }

    /// Materialize the whole tree as JSON.
    pub fn to_json(&self) -> Result<Value> {
        self.read(|reader| reader.to_json())
    }

    pub fn state_vector(&self) -> Result<StateVector> {
        self.read(|reader| reader.txn.state_vector())
    }

    /// Everything this replica has that `remote` is missing, as one update.
    pub fn encode_state_as_update(&self, remote: &StateVector) -> Result<Vec<u8>> {
        self.read(|reader| reader.txn.encode_state_as_update_v1(remote))
    }

    // ── outbox ──────────────────────────────────────────────────────

    /// Drain every change-set produced locally since the last call, in order.
    pub fn take_outbound(&self) -> Vec<ChangeSet> {
        self.inner.outbox.queue.borrow_mut().drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.inner.outbox.queue.borrow().is_empty()
    }

    /// Notified whenever a change-set lands in the outbox.
    pub fn outbound_notify(&self) -> Rc<Notify> {
        self.inner.outbox.notify.clone()
    }

    // ── initialization ──────────────────────────────────────────────

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.get()
    }

    /// Flip the document to initialized and drain parked work once, in FIFO order.
    pub fn mark_initialized(&self) {
        if self.inner.initialized.replace(true) {
            return;
        }
        log::debug!(
            "document {} initialized; replaying {} parked tasks",
            self.actor(),
            self.inner.waiting.len()
        );
        self.inner.waiting.drain_with(|task| task(self));
    }

    /// Run `callback` now if initialized, otherwise once initialization completes.
    pub fn when_initialized(&self, callback: impl FnOnce() + 'static) {
        if self.is_initialized() {
            callback();
        } else {
            self.inner.waiting.push(Box::new(move |_| callback()));
        }
    }

    // ── views and lifecycle ─────────────────────────────────────────

    /// Addressing context rooted at `base`.
    pub fn view(&self, base: impl Into<Path>) -> DocumentView {
        DocumentView::new(self, base.into())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Dispose every view and adapter, stop observing the tree and reject
    /// further mutations.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.get() {
            return;
        }
        inner.disposables.dispose_all();
        inner.disposed.set(true);
        inner.listeners.clear();
        inner.deferred.clear();
        inner.waiting.clear();
        inner.watched.borrow_mut().clear();
        log::info!("disposed document for actor {}", self.actor());
    }

    pub(crate) fn downgrade(&self) -> Weak<DocInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Rc<DocInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn upgrade(weak: &Weak<DocInner>) -> Result<Self> {
        let inner = weak.upgrade().ok_or(CollabError::Disposed)?;
        inner.ensure_live()?;
        Ok(Self { inner })
    }

    pub(crate) fn register(&self, item: Rc<dyn Disposable>) {
        self.inner.disposables.add(item);
    }

    pub(crate) fn owned_len(&self) -> usize {
        self.inner.disposables.len()
    }
}

// ───────────────────────────────────────────────────────────────────
// Reading and writing the tree
// ───────────────────────────────────────────────────────────────────

/// Read access shared by [`Reader`] and [`Mutation`].
pub trait TreeRead {
    type Txn: ReadTxn;

    fn txn(&self) -> &Self::Txn;
    fn root(&self) -> &MapRef;

    /// Kind of the node at `path`, if any.
    fn kind(&self, path: &Path) -> Result<Option<NodeKind>> {
        path::kind_at(self.txn(), self.root(), path)
    }

    /// JSON value of whatever is at `path`.
    fn get(&self, path: &Path) -> Result<Option<Value>> {
        path::value_at(self.txn(), self.root(), path)
    }

    fn text(&self, path: &Path) -> Result<Option<String>> {
        match path::resolve_container(self.txn(), self.root(), path, NodeKind::Text)? {
            Some(Node::Text(text)) => Ok(Some(text.get_string(self.txn()))),
            _ => Ok(None),
        }
    }

    fn list_len(&self, path: &Path) -> Result<usize> {
        match path::resolve_container(self.txn(), self.root(), path, NodeKind::List)? {
            Some(Node::List(list)) => Ok(list.len(self.txn()) as usize),
            _ => Ok(0),
        }
    }

    fn list_get(&self, path: &Path, index: usize) -> Result<Option<Value>> {
        match path::resolve_container(self.txn(), self.root(), path, NodeKind::List)? {
            Some(Node::List(list)) => Ok(list.get(self.txn(), index as u32).map(|out| element_json(&out))),
            _ => Ok(None),
        }
    }

    fn list_values(&self, path: &Path) -> Result<Vec<Value>> {
        match path::resolve_container(self.txn(), self.root(), path, NodeKind::List)? {
            Some(Node::List(list)) => Ok(list.iter(self.txn()).map(|out| element_json(&out)).collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// Keys of the map at `path`, sorted.
    fn map_keys(&self, path: &Path) -> Result<Vec<String>> {
        match path::resolve_container(self.txn(), self.root(), path, NodeKind::Map)? {
            Some(Node::Map(map)) => {
                let mut keys: Vec<String> = map.keys(self.txn()).map(str::to_string).collect();
                keys.sort();
                Ok(keys)
            }
            _ => Ok(Vec::new()),
        }
    }

    fn map_get(&self, path: &Path, key: &str) -> Result<Option<Value>> {
        self.get(&path.child(key))
    }

    fn to_json(&self) -> Value {
        path::materialize(self.txn(), self.root(), &Path::root(), NodeKind::Map, &mut Vec::new())
    }
}

/// List elements are plain values; anything else reads as null.
fn element_json(out: &yrs::Out) -> Value {
    match out {
        yrs::Out::Any(any) => any_to_json(any),
        _ => Value::Null,
    }
}

fn observe_container<B: DeepObservable>(container: &B, path: Path, raw: &RawLog) -> Subscription {
    let raw = raw.clone();
    container.observe_deep(move |txn, events| raw.borrow_mut().extend(diff::capture(&path, txn, events)))
}

/// Read-only view of the tree.
pub struct Reader<'doc> {
    txn: yrs::Transaction<'doc>,
    root: MapRef,
}

impl<'doc> TreeRead for Reader<'doc> {
    type Txn = yrs::Transaction<'doc>;

    fn txn(&self) -> &Self::Txn {
        &self.txn
    }

    fn root(&self) -> &MapRef {
        &self.root
    }
}

/// Mutable checkout of the tree handed to local-change mutators.
///
/// Every operation validates its arguments before writing, so a failing
/// call leaves the tree as it was.
pub struct Mutation<'doc> {
    txn: TransactionMut<'doc>,
    root: MapRef,
    touched: bool,
}

impl<'doc> TreeRead for Mutation<'doc> {
    type Txn = TransactionMut<'doc>;

    fn txn(&self) -> &Self::Txn {
        &self.txn
    }

    fn root(&self) -> &MapRef {
        &self.root
    }
}

impl Mutation<'_> {
    /// Whether anything has been written so far.
    pub fn is_touched(&self) -> bool {
        self.touched
    }

    /// Create the container at `path` if it is missing.
    pub fn ensure(&mut self, path: &Path, kind: NodeKind) -> Result<Node> {
        let (node, wrote) = path::ensure_container(&mut self.txn, &self.root, path, kind)?;
        self.touched |= wrote;
        Ok(node)
    }

    /// Store a plain value at `path`.
    pub fn set(&mut self, path: &Path, value: &Value) -> Result<()> {
        let value = json_to_any(value)?;
        path::set_entry(&mut self.txn, &self.root, path, value)?;
        self.touched = true;
        Ok(())
    }

    /// Delete whatever is at `path`. Returns whether something was removed.
    pub fn remove(&mut self, path: &Path) -> Result<bool> {
        let removed = path::remove_entry(&mut self.txn, &self.root, path)?;
        self.touched |= removed;
        Ok(removed)
    }

    // ── text ────────────────────────────────────────────────────────

    /// Insert `value` at byte offset `index` of the text at `path`.
    pub fn text_insert(&mut self, path: &Path, index: usize, value: &str) -> Result<()> {
        let current = self.text(path)?.unwrap_or_default();
        check_boundary(&current, index)?;
        if value.is_empty() {
            return Ok(());
        }
        let (text, _) = path::ensure_text(&mut self.txn, &self.root, path)?;
        text.insert(&mut self.txn, utf16_offset(&current, index), value);
        self.touched = true;
        Ok(())
    }

    /// Remove bytes `start..end` of the text at `path`, returning the removed slice.
    pub fn text_remove(&mut self, path: &Path, start: usize, end: usize) -> Result<String> {
        let current = self.text(path)?.unwrap_or_default();
        check_boundary(&current, end)?;
        check_boundary(&current, start)?;
        if start > end {
            return Err(CollabError::InvalidIndex { index: start, len: current.len() });
        }
        if start == end {
            return Ok(String::new());
        }
        let Some(Node::Text(text)) = path::resolve_container(&self.txn, &self.root, path, NodeKind::Text)? else {
            return Ok(String::new());
        };
        let from = utf16_offset(&current, start);
        let len = utf16_offset(&current, end) - from;
        text.remove_range(&mut self.txn, from, len);
        self.touched = true;
        Ok(current[start..end].to_string())
    }

    /// Replace the whole text at `path`. Returns the previous text.
    pub fn text_set(&mut self, path: &Path, value: &str) -> Result<String> {
        let current = self.text(path)?.unwrap_or_default();
        if current == value {
            self.ensure(path, NodeKind::Text)?;
            return Ok(current);
        }
        self.text_remove(path, 0, current.len())?;
        self.text_insert(path, 0, value)?;
        Ok(current)
    }

    // ── lists ───────────────────────────────────────────────────────

    /// Insert `values` at `index` of the list at `path`.
    pub fn list_insert(&mut self, path: &Path, index: usize, values: &[Value]) -> Result<()> {
        let len = self.list_len(path)?;
        if index > len {
            return Err(CollabError::InvalidIndex { index, len });
        }
        let values = values.iter().map(json_to_any).collect::<Result<Vec<_>>>()?;
        let (list, wrote) = path::ensure_list(&mut self.txn, &self.root, path)?;
        self.touched |= wrote;
        if values.is_empty() {
            return Ok(());
        }
        list.insert_range(&mut self.txn, index as u32, values);
        self.touched = true;
        Ok(())
    }

    /// Remove `count` elements from `start`, returning them.
    pub fn list_remove(&mut self, path: &Path, start: usize, count: usize) -> Result<Vec<Value>> {
        let len = self.list_len(path)?;
        if start + count > len {
            return Err(CollabError::InvalidIndex { index: start + count, len });
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let removed = self.list_values(path)?[start..start + count].to_vec();
        if let Some(Node::List(list)) = path::resolve_container(&self.txn, &self.root, path, NodeKind::List)? {
            list.remove_range(&mut self.txn, start as u32, count as u32);
            self.touched = true;
        }
        Ok(removed)
    }

    /// Replace the element at `index`, returning the previous one.
    pub fn list_set(&mut self, path: &Path, index: usize, value: &Value) -> Result<Value> {
        let len = self.list_len(path)?;
        if index >= len {
            return Err(CollabError::InvalidIndex { index, len });
        }
        let mut old = self.list_remove(path, index, 1)?;
        self.list_insert(path, index, std::slice::from_ref(value))?;
        Ok(old.pop().unwrap_or(Value::Null))
    }

    // ── maps ────────────────────────────────────────────────────────

    pub fn map_set(&mut self, path: &Path, key: &str, value: &Value) -> Result<()> {
        self.set(&path.child(key), value)
    }

    /// Remove `key` from the map at `path`, returning its value.
    pub fn map_remove(&mut self, path: &Path, key: &str) -> Result<Option<Value>> {
        let old = self.map_get(path, key)?;
        if old.is_some() {
            self.remove(&path.child(key))?;
        }
        Ok(old)
    }
}

/// Deserialize every JSON value, skipping (and logging) values of the wrong shape.
pub(crate) fn decode_values<T: serde::de::DeserializeOwned>(values: &[Value]) -> Vec<T> {
    values
        .iter()
        .filter_map(|value| match convert::from_json(value.clone()) {
            Ok(item) => Some(item),
            Err(e) => {
                log::warn!("skipping element of unexpected shape: {e}");
                None
            }
        })
        .collect()
}
