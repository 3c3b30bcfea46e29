//! Synchronous change signals.
//!
//! Slots are invoked in connection order. Emission iterates over a snapshot
//! of the connected slots, so a slot may connect or disconnect others (or
//! itself) while the signal is firing.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// Handle returned by [`Signal::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

type Slot<E> = Rc<dyn Fn(&E)>;

pub struct Signal<E> {
    slots: RefCell<Vec<(SlotId, Slot<E>)>>,
    next_id: Cell<u64>,
}

impl<E> Default for Signal<E> {
    fn default() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }
}

impl<E> Signal<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, slot: impl Fn(&E) + 'static) -> SlotId {
        let id = SlotId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.slots.borrow_mut().push((id, Rc::new(slot)));
        id
    }

    /// Returns `true` if the slot was connected.
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots.borrow_mut();
        let before = slots.len();
        slots.retain(|(slot_id, _)| *slot_id != id);
        slots.len() != before
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Slot<E>> = self.slots.borrow().iter().map(|(_, s)| s.clone()).collect();
        for slot in snapshot {
            slot(event);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.slots.borrow_mut().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_in_connection_order() {
        let signal = Signal::<u32>::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b"] {
            let log = log.clone();
            signal.connect(move |n| log.borrow_mut().push(format!("{tag}{n}")));
        }
        signal.emit(&1);
        assert_eq!(*log.borrow(), vec!["a1", "b1"]);
    }

    #[test]
    fn test_disconnect_during_emit() {
        let signal = Rc::new(Signal::<()>::new());
        let hits = Rc::new(Cell::new(0));
        let slot_id = Rc::new(Cell::new(None));
        let (s, h, id) = (signal.clone(), hits.clone(), slot_id.clone());
        let first = signal.connect(move |_| {
            h.set(h.get() + 1);
            if let Some(id) = id.get() {
                s.disconnect(id);
            }
        });
        slot_id.set(Some(first));
        signal.emit(&());
        signal.emit(&());
        assert_eq!(hits.get(), 1);
        assert!(signal.is_empty());
        assert!(!signal.disconnect(first));
    }
}
