//! Per-pass identity maps between live objects and snapshot ids.
//!
//! Ids are dense and sequential in first-discovery order, so two captures of
//! the same graph assign the same ids.

use crate::error::RestoreError;
use selune_core::object::ObjRef;
use std::collections::HashMap;

/// Capture side: live object -> id.
#[derive(Debug, Default)]
pub struct CaptureIds {
    ids: HashMap<ObjRef, u64>,
    order: Vec<ObjRef>,
}

impl CaptureIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// The object's id, assigning the next one on first sight. The flag is
    /// true when the id is new.
    pub fn assign(&mut self, obj: ObjRef) -> (u64, bool) {
        if let Some(&id) = self.ids.get(&obj) {
            return (id, false);
        }
        let id = self.order.len() as u64;
        self.ids.insert(obj, id);
        self.order.push(obj);
        (id, true)
    }

    pub fn get(&self, obj: ObjRef) -> Option<u64> {
        self.ids.get(&obj).copied()
    }

    /// The object with a given id.
    pub fn object(&self, id: u64) -> Option<ObjRef> {
        self.order.get(id as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Outcome of looking up an id during restore.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Ready(ObjRef),
    /// Declared by the snapshot but not allocated yet.
    Pending,
    /// Outside the snapshot's id range.
    Unknown,
}

/// Restore side: id -> freshly allocated object.
#[derive(Debug)]
pub struct RestoreIds {
    slots: Vec<Option<ObjRef>>,
}

impl RestoreIds {
    /// Ids `0..count` are valid. The count comes from already framed records
    /// so it is bounded by the input size.
    pub fn with_count(count: usize) -> Self {
        RestoreIds {
            slots: vec![None; count],
        }
    }

    pub fn allocate(&mut self, id: u64, obj: ObjRef) -> Result<(), RestoreError> {
        match usize::try_from(id).ok().and_then(|i| self.slots.get_mut(i)) {
            Some(slot) if slot.is_none() => {
                *slot = Some(obj);
                Ok(())
            }
            Some(_) => Err(RestoreError::DuplicateId { kind: obj.kind(), id }),
            None => Err(RestoreError::UnresolvedId {
                id,
                path: format!("{}#{}", obj.kind(), id),
            }),
        }
    }

    pub fn resolve(&self, id: u64) -> Resolution {
        match usize::try_from(id).ok().and_then(|i| self.slots.get(i)) {
            Some(Some(obj)) => Resolution::Ready(*obj),
            Some(None) => Resolution::Pending,
            None => Resolution::Unknown,
        }
    }

    /// Ids still waiting for an allocation.
    pub fn pending(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i as u64)
    }

    /// Confirm no placeholder is left. Returns the number of objects, or
    /// the first id that never received an allocation.
    pub fn finish(&self) -> Result<usize, u64> {
        match self.pending().next() {
            Some(id) => Err(id),
            None => Ok(self.slots.len()),
        }
    }
}
