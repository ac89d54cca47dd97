//! Native-function registry: symbolic names for host functions.
//!
//! Native closures are persisted by name. The registry is long-lived and
//! must be populated identically in the capturing and the restoring
//! process.

use crate::error::RegistryError;
use indexmap::IndexMap;
use selune_core::gc::{GcHeap, GcIdx};
use selune_core::object::NativeFn;
use selune_core::table::{Table, TableKey};
use selune_core::value::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[inline]
fn addr(func: NativeFn) -> usize {
    func as usize
}

/// Bidirectional name <-> function table.
#[derive(Default, Clone)]
pub struct NativeRegistry {
    /// Registration order is kept so listings are deterministic.
    by_name: IndexMap<String, NativeFn>,
    by_addr: HashMap<usize, String>,
}

/// Result of [`NativeRegistry::auto_register`].
#[derive(Debug, Default)]
pub struct AutoRegistration {
    pub registered: usize,
    /// Collisions hit along the way. They do not stop the walk.
    pub errors: Vec<RegistryError>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` under `name`.
    ///
    /// Re-registering the same pair is a no-op; a new function under an
    /// existing name replaces the old one. Registering a function that
    /// already has a different name is a collision and changes nothing.
    pub fn register(&mut self, name: impl Into<String>, func: NativeFn) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if let Some(existing) = self.by_addr.get(&addr(func)) {
            if *existing == name {
                return Ok(());
            }
            return Err(RegistryError::Collision {
                existing: existing.clone(),
                requested: name,
            });
        }
        if let Some(old) = self.by_name.insert(name.clone(), func) {
            self.by_addr.remove(&addr(old));
            tracing::debug!(name = %name, "native re-registered, replacing previous function");
        } else {
            tracing::debug!(name = %name, "native registered");
        }
        self.by_addr.insert(addr(func), name);
        Ok(())
    }

    pub fn name_of(&self, func: NativeFn) -> Option<&str> {
        self.by_addr.get(&addr(func)).map(String::as_str)
    }

    pub fn function_of(&self, name: &str) -> Option<NativeFn> {
        self.by_name.get(name).copied()
    }

    pub fn unregister(&mut self, name: &str) -> Option<NativeFn> {
        let func = self.by_name.shift_remove(name)?;
        self.by_addr.remove(&addr(func));
        Some(func)
    }

    /// Drop every registration.
    pub fn clear(&mut self) {
        self.by_name.clear();
        self.by_addr.clear();
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// Register every native closure reachable from `root` through
    /// string-keyed table fields, named by dotted path (`"math.floor"`).
    ///
    /// Tables nested more than `max_depth` levels below `root` are not
    /// visited, and each table is visited once.
    pub fn auto_register(&mut self, heap: &GcHeap, root: GcIdx<Table>, prefix: &str, max_depth: usize) -> AutoRegistration {
        let mut report = AutoRegistration::default();
        let mut visited = HashSet::from([root]);
        self.register_table(heap, root, prefix, 0, max_depth, &mut visited, &mut report);
        tracing::debug!(
            registered = report.registered,
            collisions = report.errors.len(),
            "auto-registration finished"
        );
        report
    }

    #[allow(clippy::too_many_arguments)]
    fn register_table(
        &mut self,
        heap: &GcHeap,
        table: GcIdx<Table>,
        prefix: &str,
        depth: usize,
        max_depth: usize,
        visited: &mut HashSet<GcIdx<Table>>,
        report: &mut AutoRegistration,
    ) {
        let Some(t) = heap.tables.get(table) else { return };
        let entries: Vec<(String, Value)> = t
            .hash_entries()
            .filter_map(|(k, v)| match *k {
                TableKey::String(s) => {
                    let bytes = heap.strings.get(s)?.as_bytes();
                    let key = std::str::from_utf8(bytes).ok()?;
                    Some((format!("{prefix}{key}"), *v))
                }
                _ => None,
            })
            .collect();

        for (name, v) in entries {
            match v {
                Value::Native(n) => {
                    let Some(nc) = heap.natives.get(n) else { continue };
                    match self.register(name, nc.func) {
                        Ok(()) => report.registered += 1,
                        Err(e) => report.errors.push(e),
                    }
                }
                Value::Table(child) if depth < max_depth && visited.insert(child) => {
                    let child_prefix = format!("{name}.");
                    self.register_table(heap, child, &child_prefix, depth + 1, max_depth, visited, report);
                }
                _ => {}
            }
        }
    }
}

impl fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.by_name.keys()).finish()
    }
}
