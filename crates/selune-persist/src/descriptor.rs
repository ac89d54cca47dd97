//! Object model descriptors: for every object kind, the ordered list of
//! fields and how each one persists.
//!
//! The capture sink and restore source both walk these lists, so a field is
//! written and read in exactly one place and in exactly one order. A kind
//! with no descriptor, or a descriptor that contradicts itself, is rejected
//! when the [`DescriptorSet`] is built.

use crate::error::DescriptorError;
use selune_core::object::ObjectKind;
use std::collections::HashSet;

/// How a field participates in a snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldClass {
    /// Plain data (bytes, integers, flags).
    Value,
    /// Reference that must be present; the target is always serialized.
    Owning,
    /// Reference by id; may be absent and may alias.
    Shared,
    /// Runtime-only state, never written.
    Excluded,
    /// Dynamically typed content with its own encoding (tagged values,
    /// key/value pairs, frames).
    Custom,
}

impl FieldClass {
    pub fn is_reference(self) -> bool {
        matches!(self, FieldClass::Owning | FieldClass::Shared)
    }

    pub fn is_persisted(self) -> bool {
        self != FieldClass::Excluded
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub class: FieldClass,
    /// Kinds a reference field may point at. Empty for non-references.
    pub targets: &'static [ObjectKind],
}

const fn field(name: &'static str, class: FieldClass) -> FieldDescriptor {
    FieldDescriptor {
        name,
        class,
        targets: &[],
    }
}

const fn reference(name: &'static str, class: FieldClass, targets: &'static [ObjectKind]) -> FieldDescriptor {
    FieldDescriptor { name, class, targets }
}

use FieldClass::{Custom, Excluded, Owning, Shared, Value};
use ObjectKind as K;

/// Collector mark bits live in every object header and are recomputed.
const GC_MARK: FieldDescriptor = field("gc_mark", Excluded);

const STRING_FIELDS: &[FieldDescriptor] = &[
    GC_MARK,
    // Recomputed from the bytes on intern.
    field("hash", Excluded),
    field("bytes", Value),
];

const TABLE_FIELDS: &[FieldDescriptor] = &[
    GC_MARK,
    reference("metatable", Shared, &[K::Table]),
    field("array", Custom),
    field("hash", Custom),
];

const CLOSURE_FIELDS: &[FieldDescriptor] = &[
    GC_MARK,
    reference("proto", Owning, &[K::Proto]),
    reference("upvalues", Shared, &[K::UpVal]),
];

const NATIVE_FIELDS: &[FieldDescriptor] = &[
    GC_MARK,
    // Registered symbolic name; the function address never persists.
    field("function", Value),
    field("upvalues", Custom),
    reference("env", Shared, &[K::Table]),
];

const USERDATA_FIELDS: &[FieldDescriptor] = &[
    GC_MARK,
    field("data", Value),
    reference("metatable", Shared, &[K::Table]),
    field("user_value", Custom),
];

const THREAD_FIELDS: &[FieldDescriptor] = &[
    GC_MARK,
    field("status", Value),
    field("stack", Custom),
    field("stack_top", Value),
    field("frames", Custom),
    field("open_upvals", Custom),
    field("hook_func", Custom),
    field("hook_mask", Value),
    field("hook_count", Value),
];

const PROTO_FIELDS: &[FieldDescriptor] = &[
    GC_MARK,
    field("code", Value),
    field("constants", Custom),
    reference("protos", Owning, &[K::Proto]),
    field("upvalues", Custom),
    field("num_params", Value),
    field("is_vararg", Value),
    field("max_stack_size", Value),
    reference("source", Shared, &[K::String]),
    field("linedefined", Value),
    field("lastlinedefined", Value),
    field("line_info", Value),
    field("local_vars", Custom),
];

const UPVAL_FIELDS: &[FieldDescriptor] = &[GC_MARK, field("location", Custom)];

/// Field list of a single object kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindDescriptor {
    pub kind: ObjectKind,
    pub fields: Vec<FieldDescriptor>,
}

impl KindDescriptor {
    pub fn new(kind: ObjectKind, fields: &[FieldDescriptor]) -> Self {
        KindDescriptor {
            kind,
            fields: fields.to_vec(),
        }
    }

    pub fn field(&self, index: u8) -> Option<&FieldDescriptor> {
        self.fields.get(index as usize)
    }

    pub fn index_of(&self, name: &str) -> Option<u8> {
        self.fields.iter().position(|f| f.name == name).map(|i| i as u8)
    }

    /// Persisted fields with their wire index.
    pub fn persisted(&self) -> impl Iterator<Item = (u8, &FieldDescriptor)> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.class.is_persisted())
            .map(|(i, f)| (i as u8, f))
    }

    fn validate(&self) -> Result<(), DescriptorError> {
        let kind = self.kind;
        if self.fields.len() > u8::MAX as usize {
            return Err(DescriptorError::TooManyFields {
                kind,
                count: self.fields.len(),
            });
        }
        let mut seen = HashSet::new();
        for f in &self.fields {
            if !seen.insert(f.name) {
                return Err(DescriptorError::DuplicateField { kind, field: f.name });
            }
            match (f.class.is_reference(), f.targets.is_empty()) {
                (true, true) => return Err(DescriptorError::MissingTargets { kind, field: f.name }),
                (false, false) => return Err(DescriptorError::UnexpectedTargets { kind, field: f.name }),
                _ => {}
            }
        }
        Ok(())
    }
}

/// Descriptors for every object kind, indexed by kind tag.
#[derive(Clone, Debug)]
pub struct DescriptorSet {
    kinds: Vec<KindDescriptor>,
}

impl DescriptorSet {
    /// The descriptors for the Selune object model.
    pub fn standard() -> Result<Self, DescriptorError> {
        Self::from_kinds(vec![
            KindDescriptor::new(K::String, STRING_FIELDS),
            KindDescriptor::new(K::Table, TABLE_FIELDS),
            KindDescriptor::new(K::LuaClosure, CLOSURE_FIELDS),
            KindDescriptor::new(K::NativeClosure, NATIVE_FIELDS),
            KindDescriptor::new(K::UserData, USERDATA_FIELDS),
            KindDescriptor::new(K::Thread, THREAD_FIELDS),
            KindDescriptor::new(K::Proto, PROTO_FIELDS),
            KindDescriptor::new(K::UpVal, UPVAL_FIELDS),
        ])
    }

    /// Validate and index a descriptor list. Every kind must appear once.
    pub fn from_kinds(kinds: Vec<KindDescriptor>) -> Result<Self, DescriptorError> {
        let mut slots: Vec<Option<KindDescriptor>> = vec![None; ObjectKind::ALL.len()];
        for desc in kinds {
            desc.validate()?;
            let slot = &mut slots[desc.kind.tag() as usize];
            if slot.is_some() {
                return Err(DescriptorError::DuplicateKind(desc.kind));
            }
            *slot = Some(desc);
        }
        let kinds = slots
            .into_iter()
            .zip(ObjectKind::ALL)
            .map(|(slot, kind)| slot.ok_or(DescriptorError::MissingKind(kind)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DescriptorSet { kinds })
    }

    pub fn get(&self, kind: ObjectKind) -> &KindDescriptor {
        // Complete by construction.
        &self.kinds[kind.tag() as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &KindDescriptor> {
        self.kinds.iter()
    }
}
