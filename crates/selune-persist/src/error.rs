//! Error types for snapshot capture, restore and configuration.

use selune_core::object::ObjectKind;
use std::fmt;
use thiserror::Error;

/// Where in a restore a failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Header,
    Allocate,
    Link,
    Roots,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Header => "header",
            Phase::Allocate => "allocate",
            Phase::Link => "link",
            Phase::Roots => "roots",
        })
    }
}

/// A malformed object model description. Always a programming error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DescriptorError {
    #[error("no descriptor for object kind {0}")]
    MissingKind(ObjectKind),

    #[error("object kind {0} is described twice")]
    DuplicateKind(ObjectKind),

    #[error("{kind}: field `{field}` is declared twice")]
    DuplicateField { kind: ObjectKind, field: &'static str },

    #[error("{kind}: reference field `{field}` names no target kinds")]
    MissingTargets { kind: ObjectKind, field: &'static str },

    #[error("{kind}: non-reference field `{field}` names target kinds")]
    UnexpectedTargets { kind: ObjectKind, field: &'static str },

    #[error("{kind}: {count} fields exceed the 255 field limit")]
    TooManyFields { kind: ObjectKind, count: usize },

    #[error("{kind}: field `{field}` written out of order or with the wrong class")]
    FieldOrder { kind: ObjectKind, field: &'static str },

    #[error("{kind}: field `{field}` cannot refer to a {target}")]
    TargetKind {
        kind: ObjectKind,
        field: &'static str,
        target: ObjectKind,
    },

    #[error("{kind}: persisted field `{field}` was never written")]
    Incomplete { kind: ObjectKind, field: &'static str },
}

/// Native-function registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("native name must not be empty")]
    EmptyName,

    #[error("native function already registered as `{existing}`, refusing `{requested}`")]
    Collision { existing: String, requested: String },
}

/// Capture failures. Capture never mutates the runtime, so a failed capture
/// leaves nothing behind.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("unserializable {object} at {path}: {reason}")]
    Unserializable {
        /// Human-readable name of the offending object.
        object: String,
        /// Field path of the reference that reached it.
        path: String,
        reason: String,
    },

    #[error("dangling reference to freed {kind} #{index} at {path}")]
    Dangling {
        kind: ObjectKind,
        index: u32,
        path: String,
    },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Restore failures. A failed restore exposes no partially built objects.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("not a snapshot (bad magic)")]
    BadMagic,

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),

    #[error("snapshot built for bytecode revision {found:#x}, runtime is {expected:#x}")]
    BytecodeRevision { found: u8, expected: u8 },

    #[error("expected a {expected} snapshot, found a {found} snapshot")]
    ModeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("truncated snapshot at offset {offset} ({phase})")]
    Truncated { offset: usize, phase: Phase },

    #[error("corrupt snapshot ({phase}) at offset {offset}: {detail}")]
    Framing {
        phase: Phase,
        offset: usize,
        detail: String,
    },

    #[error("duplicate object id {id} ({kind})")]
    DuplicateId { kind: ObjectKind, id: u64 },

    #[error("snapshot declares {declared} objects but contains {found}")]
    CountMismatch { declared: u64, found: u64 },

    #[error("unresolved object id {id} referenced from {path}")]
    UnresolvedId { id: u64, path: String },

    #[error("unknown native function `{name}` for {kind} #{id}")]
    UnknownNative {
        name: String,
        kind: ObjectKind,
        id: u64,
    },

    #[error("corrupt snapshot ({phase}) at {path}: {detail}")]
    Corrupt {
        phase: Phase,
        path: String,
        detail: String,
    },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The field a capture or restore step is working on. Renders as a dotted
/// path such as `table#3.hash`, or `roots.globals` for the root section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Location {
    pub kind: Option<ObjectKind>,
    pub id: Option<u64>,
    pub field: &'static str,
}

impl Location {
    pub fn root(field: &'static str) -> Self {
        Location {
            kind: None,
            id: None,
            field,
        }
    }

    pub fn object(kind: ObjectKind, id: u64, field: &'static str) -> Self {
        Location {
            kind: Some(kind),
            id: Some(id),
            field,
        }
    }

    pub fn path(&self) -> String {
        match (self.kind, self.id) {
            (Some(k), Some(i)) => format!("{k}#{i}.{}", self.field),
            (Some(k), None) => format!("{k}.{}", self.field),
            _ => format!("roots.{}", self.field),
        }
    }
}
