//! # cellsync-core
//!
//! Conflict-free replicated document core for collaborative notebooks.
//!
//! A [`ReplicatedDocument`] owns one CRDT tree (a yrs `Doc`), applies local
//! mutations as atomic change-sets, merges remote change-sets and reports
//! every applied change as a structural [`Diff`]. Typed adapters
//! ([`ReplicatedString`], [`ReplicatedList`], [`ReplicatedMap`],
//! [`ReplicatedValue`]) are thin views over a [`Path`] in that tree.
//!
//! ```text
//! ┌────────────── DocumentView ──────────────┐
//! │ create_string / create_list / create_map │
//! └───────────────────┬──────────────────────┘
//!                     │ submit (gated, deferred until initialized)
//!          ┌──────────▼──────────┐        ┌──────────────────────┐
//!          │  ReplicatedDocument │───────▶│ Outbox (ChangeSet)   │──▶ channel
//!          │  yrs Doc + gate     │◀───────│ merge_remote(bytes)  │◀── channel
//!          └──────────┬──────────┘        └──────────────────────┘
//!                     │ DocumentChange { diff, before, after, origin }
//!                     ▼
//!            listeners / adapter change signals
//! ```
//!
//! Transport and the relay server live in `cellsync-collab`.

pub mod changeset;
pub mod convert;
pub mod diff;
pub mod document;
pub mod error;
pub mod gate;
pub mod input;
pub mod path;
pub mod primitives;
pub mod registry;
pub mod signal;
pub mod view;

pub use changeset::{ActorId, ChangeSet};
pub use diff::{Content, Diff, DiffEntry, Edit};
pub use document::{
    Disposable, DocumentChange, DocumentConfig, Mutation, Origin, Reader, ReplicatedDocument,
    TreeRead,
};
pub use error::{CollabError, Result};
pub use gate::{GateState, MutualExclusionGate, TaskQueue};
pub use input::{InputError, InputExchange, PendingInput};
pub use path::{Node, NodeKind, Path, ROOT_NAME};
pub use primitives::{
    Item, ListChange, ListChangeKind, MapChange, MapChangeKind, ReplicatedList, ReplicatedMap,
    ReplicatedString, ReplicatedValue, StringChange, StringChangeKind, ValueChange,
};
pub use registry::{Collaborator, CollaboratorRegistry};
pub use signal::{Signal, SlotId};
pub use view::DocumentView;

/// Re-exported so downstream crates can exchange state vectors and
/// snapshots without depending on yrs directly.
pub use yrs::StateVector;
