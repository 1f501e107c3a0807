//! The injection object registry: one mutable injection state per storage
//! object id.
//!
//! Locking protocol: the registry map is guarded by a global existence lock
//! that is only held for lookup, insert, and remove. Each object guards its
//! own mutable fields. Callers whose work outlives the lookup (the span
//! between pre-send and completion) hold an in-progress count on the object;
//! a disabled object is reclaimed lazily when that count drains to zero, so
//! dispatch never races object teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use faultline_types::{Lba, MAX_POSITIONS, ObjectClass, ObjectId, PositionBitmask};

use crate::media::MediaTracker;
use crate::stats::{ObjectCounters, ObjectStats};

/// Per-object mutable state guarded by the object lock.
#[derive(Debug)]
pub(crate) struct ObjectState {
    /// Media-error progression, one tracker per array position.
    pub media: [MediaTracker; MAX_POSITIONS as usize],
    /// Copy operations inject on every other read; this is the phase bit.
    pub inject_copy_read: bool,
}

impl Default for ObjectState {
    fn default() -> Self {
        Self {
            media: [MediaTracker::default(); MAX_POSITIONS as usize],
            inject_copy_read: true,
        }
    }
}

/// Injection state for one storage object.
#[derive(Debug)]
pub struct InjectionObject {
    id: ObjectId,
    class: ObjectClass,
    enabled: AtomicBool,
    /// Positions whose edges are actively intercepted.
    edge_hooks: AtomicU32,
    /// Positions currently degraded; injection skips them.
    degraded: AtomicU32,
    /// Offset subtracted from request LBAs before table normalization.
    lba_offset: AtomicU64,
    /// The object mirrors a proactive copy; lifts the spare-type restriction.
    proactive_copy: AtomicBool,
    in_progress: AtomicU32,
    pub(crate) counters: ObjectCounters,
    state: Mutex<ObjectState>,
}

impl InjectionObject {
    fn new(id: ObjectId, class: ObjectClass) -> Self {
        Self {
            id,
            class,
            enabled: AtomicBool::new(true),
            edge_hooks: AtomicU32::new(u32::from(u16::MAX)),
            degraded: AtomicU32::new(0),
            lba_offset: AtomicU64::new(0),
            proactive_copy: AtomicBool::new(false),
            in_progress: AtomicU32::new(0),
            counters: ObjectCounters::default(),
            state: Mutex::new(ObjectState::default()),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn edge_hooks(&self) -> PositionBitmask {
        PositionBitmask::new(self.edge_hooks.load(Ordering::Relaxed) as u16)
    }

    pub fn set_edge_hooks(&self, hooks: PositionBitmask) {
        self.edge_hooks
            .store(u32::from(hooks.bits()), Ordering::Relaxed);
    }

    pub fn degraded_positions(&self) -> PositionBitmask {
        PositionBitmask::new(self.degraded.load(Ordering::Relaxed) as u16)
    }

    pub fn set_degraded_positions(&self, degraded: PositionBitmask) {
        self.degraded
            .store(u32::from(degraded.bits()), Ordering::Relaxed);
    }

    pub fn lba_offset(&self) -> Lba {
        self.lba_offset.load(Ordering::Relaxed)
    }

    pub fn set_lba_offset(&self, offset: Lba) {
        self.lba_offset.store(offset, Ordering::Relaxed);
    }

    pub fn is_proactive_copy(&self) -> bool {
        self.proactive_copy.load(Ordering::Relaxed)
    }

    pub fn set_proactive_copy(&self, proactive: bool) {
        self.proactive_copy.store(proactive, Ordering::Relaxed);
    }

    pub fn in_progress(&self) -> u32 {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ObjectStats {
        self.counters.snapshot(self.in_progress())
    }

    /// Locks the object's mutable state. Poisoning is swallowed: the state
    /// is counters and trackers, coherent at every step.
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ObjectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn reset_media(&self) {
        let mut state = self.lock_state();
        for tracker in &mut state.media {
            tracker.reset();
        }
    }
}

/// Owner of every [`InjectionObject`].
#[derive(Debug, Default)]
pub struct Registry {
    objects: Mutex<HashMap<ObjectId, Arc<InjectionObject>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the object if absent and marks it enabled. Re-enabling an
    /// existing object keeps its counters and trackers.
    pub fn enable(&self, id: ObjectId, class: ObjectClass) -> Arc<InjectionObject> {
        let mut objects = self.lock_map();
        let object = objects
            .entry(id)
            .or_insert_with(|| Arc::new(InjectionObject::new(id, class)))
            .clone();
        object.enabled.store(true, Ordering::Release);
        tracing::debug!(object = %id, ?class, "injection object enabled");
        object
    }

    /// Marks the object disabled. Reclaims it immediately when idle;
    /// otherwise the last completion reclaims it via
    /// [`Registry::end_operation`].
    pub fn disable(&self, id: ObjectId) -> bool {
        let mut objects = self.lock_map();
        let Some(object) = objects.get(&id) else {
            return false;
        };
        object.enabled.store(false, Ordering::Release);
        if object.in_progress() == 0 {
            objects.remove(&id);
            tracing::debug!(object = %id, "injection object disabled and reclaimed");
        } else {
            tracing::debug!(object = %id, "injection object disabled, reclaim deferred");
        }
        true
    }

    pub fn find(&self, id: ObjectId) -> Option<Arc<InjectionObject>> {
        self.lock_map().get(&id).cloned()
    }

    /// Opens the span between pre-send and completion: the object cannot be
    /// reclaimed until the matching [`Registry::end_operation`].
    pub fn begin_operation(&self, object: &InjectionObject) {
        object.in_progress.fetch_add(1, Ordering::AcqRel);
    }

    /// Closes an operation span; reclaims the object if it was disabled
    /// while the operation was in flight.
    pub fn end_operation(&self, id: ObjectId) {
        let mut objects = self.lock_map();
        let Some(object) = objects.get(&id) else {
            return;
        };
        let previous = object.in_progress.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "end_operation without begin_operation");
        if previous == 1 && !object.is_enabled() {
            objects.remove(&id);
            tracing::debug!(object = %id, "deferred reclaim of disabled object");
        }
    }

    /// Force removal regardless of the enabled flag; refuses while
    /// operations are in flight.
    pub fn remove(&self, id: ObjectId) -> Result<(), u32> {
        let mut objects = self.lock_map();
        let Some(object) = objects.get(&id) else {
            return Ok(());
        };
        let in_progress = object.in_progress();
        if in_progress > 0 {
            return Err(in_progress);
        }
        objects.remove(&id);
        Ok(())
    }

    /// Disables every object; idle ones are reclaimed now, busy ones on
    /// their last completion.
    pub fn disable_all(&self) {
        let mut objects = self.lock_map();
        objects.retain(|id, object| {
            object.enabled.store(false, Ordering::Release);
            let busy = object.in_progress() > 0;
            if !busy {
                tracing::debug!(object = %id, "injection object reclaimed on global disable");
            }
            busy
        });
    }

    pub fn len(&self) -> usize {
        self.lock_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_map().is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.lock_map()
            .values()
            .filter(|object| object.is_enabled())
            .count()
    }

    fn lock_map(&self) -> MutexGuard<'_, HashMap<ObjectId, Arc<InjectionObject>>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enable_is_idempotent() {
        let registry = Registry::new();
        let a = registry.enable(ObjectId::new(1), ObjectClass::RaidGroup);
        let b = registry.enable(ObjectId::new(1), ObjectClass::RaidGroup);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn disable_reclaims_idle_object() {
        let registry = Registry::new();
        registry.enable(ObjectId::new(1), ObjectClass::Lun);
        assert!(registry.disable(ObjectId::new(1)));
        assert!(registry.find(ObjectId::new(1)).is_none());
    }

    #[test]
    fn disable_defers_reclaim_while_busy() {
        let registry = Registry::new();
        let object = registry.enable(ObjectId::new(1), ObjectClass::Lun);
        registry.begin_operation(&object);

        registry.disable(ObjectId::new(1));
        // Still findable: an in-flight completion needs it.
        let found = registry.find(ObjectId::new(1)).unwrap();
        assert!(!found.is_enabled());

        registry.end_operation(ObjectId::new(1));
        assert!(registry.find(ObjectId::new(1)).is_none());
    }

    #[test]
    fn remove_refuses_busy_object() {
        let registry = Registry::new();
        let object = registry.enable(ObjectId::new(7), ObjectClass::Lun);
        registry.begin_operation(&object);
        assert_eq!(registry.remove(ObjectId::new(7)), Err(1));
        registry.end_operation(ObjectId::new(7));
        assert_eq!(registry.remove(ObjectId::new(7)), Ok(()));
    }

    #[test]
    fn disable_all_drains() {
        let registry = Registry::new();
        registry.enable(ObjectId::new(1), ObjectClass::Lun);
        let busy = registry.enable(ObjectId::new(2), ObjectClass::Lun);
        registry.begin_operation(&busy);

        registry.disable_all();
        assert_eq!(registry.len(), 1);
        registry.end_operation(ObjectId::new(2));
        assert!(registry.is_empty());
    }
}
