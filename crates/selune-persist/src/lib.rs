//! Selune persistence: snapshot a live runtime's object graph to bytes and
//! rebuild it later, preserving sharing, cycles and string interning.

pub mod codec;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod inspect;
pub mod natives;
mod resolve;
mod walker;

pub use config::{SnapshotConfig, ThreadPolicy, UnserializablePolicy};
pub use descriptor::{DescriptorSet, FieldClass, FieldDescriptor, KindDescriptor};
pub use error::{CaptureError, ConfigError, DescriptorError, Phase, RegistryError, RestoreError};
pub use inspect::{summarize, Summary};
pub use natives::{AutoRegistration, NativeRegistry};
pub use walker::{Diagnostic, DiagnosticAction, Snapshot};

use resolve::Restorer;
use selune_core::state::LuaState;
use selune_core::value::Value;
use walker::Capturer;

/// Entry point for capture and restore. Cheap to build; the descriptor set
/// is validated once here and shared by every pass.
#[derive(Debug)]
pub struct Snapshotter<'r> {
    config: SnapshotConfig,
    descriptors: DescriptorSet,
    natives: &'r NativeRegistry,
}

impl<'r> Snapshotter<'r> {
    pub fn new(config: SnapshotConfig, natives: &'r NativeRegistry) -> Result<Self, DescriptorError> {
        Ok(Self::with_descriptors(config, DescriptorSet::standard()?, natives))
    }

    /// Use a caller-supplied descriptor set. Capture and restore fail with a
    /// descriptor error if it disagrees with the object layouts.
    pub fn with_descriptors(config: SnapshotConfig, descriptors: DescriptorSet, natives: &'r NativeRegistry) -> Self {
        Snapshotter {
            config,
            descriptors,
            natives,
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn natives(&self) -> &NativeRegistry {
        self.natives
    }

    /// Snapshot the whole runtime. Read-only; a failed capture produces no
    /// output.
    pub fn capture(&self, state: &LuaState) -> Result<Snapshot, CaptureError> {
        let span = tracing::info_span!("capture", mode = "state", threads = ?self.config.threads);
        let _enter = span.enter();
        let snapshot = Capturer::new(state, &self.descriptors, self.natives, &self.config).capture_state()?;
        tracing::info!(objects = snapshot.object_count, bytes = snapshot.bytes.len(), "captured runtime");
        Ok(snapshot)
    }

    /// Snapshot one value and everything reachable from it.
    pub fn capture_value(&self, state: &LuaState, value: Value) -> Result<Snapshot, CaptureError> {
        let span = tracing::info_span!("capture", mode = "value", threads = ?self.config.threads);
        let _enter = span.enter();
        let snapshot = Capturer::new(state, &self.descriptors, self.natives, &self.config).capture_value(value)?;
        tracing::info!(objects = snapshot.object_count, bytes = snapshot.bytes.len(), "captured value");
        Ok(snapshot)
    }

    /// Rebuild a runtime from a full-state snapshot.
    pub fn restore(&self, bytes: &[u8]) -> Result<LuaState, RestoreError> {
        let span = tracing::info_span!("restore", mode = "state", bytes = bytes.len());
        let _enter = span.enter();
        let state = Restorer::new(&self.descriptors, self.natives).restore_state(bytes)?;
        tracing::info!(objects = state.heap.object_count(), "restored runtime");
        Ok(state)
    }

    /// Rebuild a single-value snapshot inside `state`. Strings are shared
    /// with the existing interner and the returned value is pinned; release
    /// it with [`LuaState::unpin`]. On failure `state` is left as it was.
    pub fn restore_value_into(&self, state: &mut LuaState, bytes: &[u8]) -> Result<Value, RestoreError> {
        let span = tracing::info_span!("restore", mode = "value", bytes = bytes.len());
        let _enter = span.enter();
        let value = Restorer::new(&self.descriptors, self.natives).restore_value_into(state, bytes)?;
        tracing::info!(value = ?value, "restored value");
        Ok(value)
    }
}
