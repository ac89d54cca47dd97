//! Framing-level snapshot inspection. Nothing is allocated on any heap and
//! payloads are never decoded, so this works on snapshots from any
//! bytecode revision.

use crate::codec::{self, Header};
use crate::error::RestoreError;
use selune_core::object::ObjectKind;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordInfo {
    pub kind: ObjectKind,
    pub id: u64,
    /// Byte range of the payload within the snapshot.
    pub payload: Range<usize>,
}

#[derive(Clone, Debug)]
pub struct Summary {
    pub header: Header,
    /// Record count per kind. Kinds with no records are absent.
    pub counts: BTreeMap<ObjectKind, usize>,
    /// Payload bytes per kind.
    pub bytes: BTreeMap<ObjectKind, usize>,
    pub records: Vec<RecordInfo>,
    pub roots: Range<usize>,
}

impl Summary {
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_objects(&self) -> usize {
        self.records.len()
    }
}

/// Validate the framing of `bytes` and report what it contains.
pub fn summarize(bytes: &[u8]) -> Result<Summary, RestoreError> {
    let frame = codec::read_frame(bytes)?;
    let mut counts = BTreeMap::new();
    let mut sizes = BTreeMap::new();
    let records = frame
        .records
        .iter()
        .map(|r| {
            *counts.entry(r.kind).or_insert(0) += 1;
            *sizes.entry(r.kind).or_insert(0) += r.payload.len();
            RecordInfo {
                kind: r.kind,
                id: r.id,
                payload: r.offset..r.offset + r.payload.len(),
            }
        })
        .collect();
    Ok(Summary {
        header: frame.header,
        counts,
        bytes: sizes,
        records,
        roots: frame.roots_offset..frame.roots_offset + frame.roots.len(),
    })
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        writeln!(
            f,
            "snapshot v{} ({}{}), bytecode revision {:#04x}, {} objects",
            h.version,
            h.mode_name(),
            if h.is_deep() { ", deep threads" } else { "" },
            h.bytecode_revision,
            h.object_count
        )?;
        for (kind, count) in &self.counts {
            let bytes = self.bytes.get(kind).copied().unwrap_or(0);
            writeln!(f, "  {kind:<9} {count:>8} objects {bytes:>10} bytes")?;
        }
        write!(f, "  roots     {:>27} bytes", self.roots.len())
    }
}
