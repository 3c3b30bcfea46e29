//! Replica convergence and merge idempotence.

use cellsync_core::{
    ChangeSet, DocumentConfig, Origin, ReplicatedDocument, ReplicatedList, ReplicatedMap,
    ReplicatedString,
};
use proptest::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;

// =============================================================================
// Helpers
// =============================================================================

#[derive(Clone, Debug)]
enum Op {
    ListInsert { index: usize, value: i64 },
    ListRemove { index: usize },
    ListMove { from: usize, to: usize },
    TextInsert { pos_pct: f64, text: String },
    TextRemove { pos_pct: f64, len: usize },
    MapSet { key: u8, value: i64 },
    MapDelete { key: u8 },
}

fn arbitrary_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..6usize, any::<i64>()).prop_map(|(index, value)| Op::ListInsert { index, value }),
        (0..6usize).prop_map(|index| Op::ListRemove { index }),
        (0..6usize, 0..6usize).prop_map(|(from, to)| Op::ListMove { from, to }),
        // ASCII only, so every offset is a char boundary.
        (0.0..=1.0f64, "[a-z]{1,5}").prop_map(|(pos_pct, text)| Op::TextInsert { pos_pct, text }),
        (0.0..=1.0f64, 1..4usize).prop_map(|(pos_pct, len)| Op::TextRemove { pos_pct, len }),
        (0..4u8, any::<i64>()).prop_map(|(key, value)| Op::MapSet { key, value }),
        (0..4u8).prop_map(|key| Op::MapDelete { key }),
    ]
}

struct Replica {
    doc: ReplicatedDocument,
    list: ReplicatedList<i64>,
    text: ReplicatedString,
    meta: ReplicatedMap<i64>,
}

impl Replica {
    fn new() -> Self {
        let doc = ReplicatedDocument::new(DocumentConfig::default());
        let view = doc.view(["nb1"]);
        Self {
            list: view.create_list("cells").unwrap(),
            text: view.create_string(["cells_text", "source"]).unwrap(),
            meta: view.create_map("metadata").unwrap(),
            doc,
        }
    }

    fn apply(&self, op: &Op) {
        match op {
            Op::ListInsert { index, value } => self.list.insert(*index, *value).unwrap(),
            Op::ListRemove { index } => {
                self.list.remove(*index).unwrap();
            }
            Op::ListMove { from, to } => self.list.move_item(*from, *to).unwrap(),
            Op::TextInsert { pos_pct, text } => {
                let len = self.text.len().unwrap();
                let pos = ((*pos_pct * len as f64) as usize).min(len);
                self.text.insert(pos, text).unwrap();
            }
            Op::TextRemove { pos_pct, len } => {
                let total = self.text.len().unwrap();
                let start = ((*pos_pct * total as f64) as usize).min(total);
                self.text.remove(start, (start + len).min(total)).unwrap();
            }
            Op::MapSet { key, value } => {
                self.meta.set(&format!("k{key}"), *value).unwrap();
            }
            Op::MapDelete { key } => {
                self.meta.delete(&format!("k{key}")).unwrap();
            }
        }
    }

    fn run(&self, ops: &[Op]) -> Vec<ChangeSet> {
        for op in ops {
            self.apply(op);
        }
        self.doc.take_outbound()
    }

    fn merge_all(&self, change_sets: &[ChangeSet]) {
        for cs in change_sets {
            self.doc.merge_remote(&cs.encode().unwrap()).unwrap();
        }
    }
}

/// Interleave two sequences preserving each one's internal order.
fn interleave(a: &[ChangeSet], b: &[ChangeSet], pattern: &[bool]) -> Vec<ChangeSet> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len() + b.len());
    for take_a in pattern.iter().copied().chain(std::iter::repeat(true)) {
        if i == a.len() && j == b.len() {
            break;
        }
        if (take_a && i < a.len()) || j == b.len() {
            out.push(a[i].clone());
            i += 1;
        } else {
            out.push(b[j].clone());
            j += 1;
        }
    }
    out
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Replicas converge whatever the cross-actor interleaving.
    #[test]
    fn replicas_converge(
        a_ops in prop::collection::vec(arbitrary_op(), 0..16),
        b_ops in prop::collection::vec(arbitrary_op(), 0..16),
        pattern in prop::collection::vec(any::<bool>(), 0..32),
    ) {
        let a = Replica::new();
        let b = Replica::new();
        let c = Replica::new();

        let from_a = a.run(&a_ops);
        let from_b = b.run(&b_ops);

        a.merge_all(&from_b);
        b.merge_all(&from_a);
        c.merge_all(&interleave(&from_a, &from_b, &pattern));

        let expected = a.doc.to_json().unwrap();
        prop_assert_eq!(&b.doc.to_json().unwrap(), &expected);
        prop_assert_eq!(&c.doc.to_json().unwrap(), &expected);
        prop_assert_eq!(a.list.to_vec().unwrap(), c.list.to_vec().unwrap());
        prop_assert_eq!(a.text.text().unwrap(), c.text.text().unwrap());
    }

    /// Applying the same change twice yields the same tree as applying it once.
    #[test]
    fn merging_twice_is_idempotent(ops in prop::collection::vec(arbitrary_op(), 1..16)) {
        let source = Replica::new();
        let change_sets = source.run(&ops);

        let once = Replica::new();
        once.merge_all(&change_sets);

        let twice = Replica::new();
        twice.merge_all(&change_sets);
        twice.merge_all(&change_sets);
        // Bypass the per-actor sequence check: the CRDT itself must be idempotent.
        for cs in &change_sets {
            for fragment in &cs.fragments {
                twice.doc.merge_update(fragment, Origin::Remote(cs.actor)).unwrap();
            }
        }

        prop_assert_eq!(twice.doc.to_json().unwrap(), once.doc.to_json().unwrap());
        prop_assert_eq!(once.doc.to_json().unwrap(), source.doc.to_json().unwrap());
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CellRef {
    id: String,
}

#[test]
fn concurrent_inserts_at_same_index_order_identically() {
    let a = ReplicatedDocument::new(DocumentConfig::default());
    let b = ReplicatedDocument::new(DocumentConfig::default());

    // Both start from the same (empty but existing) list.
    let list_a = a.view("nb").create_list::<CellRef>("cells").unwrap();
    list_a.push(CellRef { id: "seed".into() }).unwrap();
    list_a.remove(0).unwrap();
    for cs in a.take_outbound() {
        b.merge_change_set(&cs).unwrap();
    }
    let list_b = b.view("nb").create_list::<CellRef>("cells").unwrap();
    assert!(list_b.is_empty().unwrap());

    list_a.insert(0, CellRef { id: "c1".into() }).unwrap();
    list_b.insert(0, CellRef { id: "c2".into() }).unwrap();
    let from_a = a.take_outbound();
    let from_b = b.take_outbound();
    for cs in &from_b {
        a.merge_change_set(cs).unwrap();
    }
    for cs in &from_a {
        b.merge_change_set(cs).unwrap();
    }

    let on_a = list_a.to_vec().unwrap();
    let on_b = list_b.to_vec().unwrap();
    assert_eq!(on_a.len(), 2);
    assert_eq!(on_a, on_b);
    let ids: Vec<&str> = on_a.iter().map(|c| c.id.as_str()).collect();
    assert!(ids.contains(&"c1") && ids.contains(&"c2"));
}

/// Deliver each replica's pending change-sets to the other.
fn exchange(a: &ReplicatedDocument, b: &ReplicatedDocument) {
    let (from_a, from_b) = (a.take_outbound(), b.take_outbound());
    for cs in &from_b {
        a.merge_change_set(cs).unwrap();
    }
    for cs in &from_a {
        b.merge_change_set(cs).unwrap();
    }
}

#[test]
fn concurrent_container_creation_merges_contents() {
    let a = ReplicatedDocument::new(DocumentConfig::default());
    let b = ReplicatedDocument::new(DocumentConfig::default());
    a.view("nb").create_map::<i64>("meta").unwrap().set("a", 1).unwrap();
    b.view("nb").create_map::<i64>("meta").unwrap().set("b", 2).unwrap();

    exchange(&a, &b);
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    assert_eq!(a.to_json().unwrap()["nb"]["meta"], json!({"a": 1, "b": 2}));
}

#[test]
fn fresh_replicas_writing_same_key_converge() {
    let a = ReplicatedDocument::new(DocumentConfig::default());
    let b = ReplicatedDocument::new(DocumentConfig::default());
    let meta_a = a.view("nb").create_map::<String>("meta").unwrap();
    let meta_b = b.view("nb").create_map::<String>("meta").unwrap();
    meta_a.set("kernel", "python3".into()).unwrap();
    meta_b.set("kernel", "julia".into()).unwrap();

    exchange(&a, &b);
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    assert_eq!(meta_a.get("kernel").unwrap(), meta_b.get("kernel").unwrap());
    assert!(meta_a.get("kernel").unwrap().is_some());
}

#[test]
fn concurrent_inserts_into_fresh_lists_keep_both() {
    let a = ReplicatedDocument::new(DocumentConfig::default());
    let b = ReplicatedDocument::new(DocumentConfig::default());
    let list_a = a.view("nb").create_list::<CellRef>("cells").unwrap();
    let list_b = b.view("nb").create_list::<CellRef>("cells").unwrap();

    list_a.insert(0, CellRef { id: "c1".into() }).unwrap();
    list_b.insert(0, CellRef { id: "c2".into() }).unwrap();
    exchange(&a, &b);

    let on_a = list_a.to_vec().unwrap();
    assert_eq!(on_a, list_b.to_vec().unwrap());
    let ids: Vec<&str> = on_a.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"c1") && ids.contains(&"c2"));
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
}

#[test]
fn concurrent_sources_in_sibling_cells_both_survive() {
    let a = ReplicatedDocument::new(DocumentConfig::default());
    let b = ReplicatedDocument::new(DocumentConfig::default());
    let source_a = a.view(["nb", "cells", "c1"]).create_string("source").unwrap();
    let source_b = b.view(["nb", "cells", "c2"]).create_string("source").unwrap();
    source_a.set_text("import numpy").unwrap();
    source_b.set_text("print(1)").unwrap();

    exchange(&a, &b);
    let expected = json!({"nb": {"cells": {
        "c1": {"source": "import numpy"},
        "c2": {"source": "print(1)"},
    }}});
    assert_eq!(a.to_json().unwrap(), expected);
    assert_eq!(b.to_json().unwrap(), expected);

    let mirror = b.view(["nb", "cells", "c1"]).create_string("source").unwrap();
    assert_eq!(mirror.text().unwrap(), "import numpy");
    source_a.insert(0, "# ").unwrap();
    exchange(&a, &b);
    assert_eq!(mirror.text().unwrap(), "# import numpy");
}
