//! # faultline-engine: The injection engine
//!
//! Ties the record table and the corruption recipes into the I/O path:
//! - [`Registry`] of per-object injection state with the in-progress
//!   protocol that keeps teardown race-free.
//! - The dispatcher ([`Engine::pre_send`] / [`Engine::complete`]) matching
//!   requests against the active table and applying faults.
//! - [`MediaTracker`] progression for media-error records.
//! - [`DelayQueue`](delay) worker for DELAY_DOWN / DELAY_UP records.
//! - Counters ([`EngineStats`], [`ObjectStats`]) for test assertions.
//!
//! The engine is explicitly constructed and torn down; there is no global
//! state. Callers run the dispatcher synchronously on their own threads; the
//! only engine thread is the delay worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::SeedableRng;
use rand::rngs::SmallRng;

use faultline_table::{ActiveTable, ErrorTable, ValidateOptions};
use faultline_types::{Lba, ObjectClass, ObjectId, PositionBitmask};

mod config;
pub mod delay;
mod dispatch;
mod error;
mod media;
mod registry;
mod stats;

pub use config::EngineConfig;
pub use delay::{DelayHandle, DelaySink, ReleaseReason};
pub use dispatch::{CompletionOutcome, CompletionToken, DelayedPayload, PreSendOutcome};
pub use error::EngineError;
pub use media::{MediaTracker, WriteVerifyOutcome};
pub use registry::{InjectionObject, Registry};
pub use stats::{EngineStats, ObjectStats};

use delay::DelayQueue;
use stats::GlobalCounters;

/// State shared between the engine facade, the dispatcher, and the delay
/// release path.
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    enabled: AtomicBool,
    pub(crate) registry: Registry,
    table: RwLock<Option<Arc<ActiveTable>>>,
    pub(crate) counters: GlobalCounters,
    rng: Mutex<SmallRng>,
}

impl Shared {
    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn active_table(&self) -> Option<Arc<ActiveTable>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs `f` with the engine RNG. One RNG, one lock: RANDOM and
    /// TRANS_RND draws stay reproducible for a fixed seed and request order.
    pub(crate) fn draw<T>(&self, f: impl FnOnce(&mut SmallRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

/// The fault-injection engine.
pub struct Engine {
    pub(crate) shared: Arc<Shared>,
    pub(crate) delay: DelayQueue<DelayedPayload>,
}

impl Engine {
    /// Engine without a release sink: delayed sends are discharged and
    /// dropped on release. Use [`Engine::with_sink`] when delay records are
    /// in play.
    pub fn new(config: EngineConfig) -> Self {
        Self::build(config, None)
    }

    /// Engine with a release sink receiving every delayed payload exactly
    /// once. A [`DelayedPayload::Send`] must be resumed: send it downstream
    /// and call [`Engine::complete`] with its token (a cancelled release
    /// just means "resume now").
    pub fn with_sink(config: EngineConfig, sink: DelaySink<DelayedPayload>) -> Self {
        Self::build(config, Some(sink))
    }

    fn build(config: EngineConfig, sink: Option<DelaySink<DelayedPayload>>) -> Self {
        let shared = Arc::new(Shared {
            enabled: AtomicBool::new(false),
            registry: Registry::new(),
            table: RwLock::new(None),
            counters: GlobalCounters::default(),
            rng: Mutex::new(SmallRng::seed_from_u64(config.seed)),
            config,
        });
        let release_shared = Arc::clone(&shared);
        let release: DelaySink<DelayedPayload> = Box::new(move |payload, reason| {
            if let Some(sink) = &sink {
                sink(payload, reason);
                return;
            }
            match payload {
                DelayedPayload::Send { token, .. } => {
                    // Nothing will resume this send; discharge its token so
                    // the object can be reclaimed.
                    release_shared.registry.end_operation(token.object_id);
                    tracing::debug!(?reason, "delayed send released without a sink");
                }
                DelayedPayload::Finished { .. } => {
                    tracing::debug!(?reason, "delayed completion released without a sink");
                }
            }
        });
        let poll_interval = shared.config.poll_interval;
        Self {
            delay: DelayQueue::new(poll_interval, release),
            shared,
        }
    }

    // ========================================================================
    // Global administration
    // ========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Turns injection on and zeroes the global counters.
    pub fn enable(&self) {
        self.shared.counters.reset();
        self.shared.enabled.store(true, Ordering::Release);
        tracing::debug!("injection enabled");
    }

    /// Turns injection off, drains the delay queue, and disables every
    /// object.
    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::Release);
        let cancelled = self.delay.cancel_all();
        self.shared.registry.disable_all();
        tracing::debug!(cancelled, "injection disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Activates `table` (randomize, recompute `err_adj`, validate) and
    /// replaces the current one. An invalid table leaves the current one in
    /// place.
    pub fn load_table(&self, table: ErrorTable) -> Result<(), EngineError> {
        if !self.shared.is_enabled() {
            return Err(EngineError::NotEnabled);
        }
        let options = ValidateOptions {
            poc_injection: self.shared.config.poc_injection,
        };
        let active = self.shared.draw(|rng| table.activate(options, rng))?;
        let mut slot = self
            .shared
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(records = active.records.len(), "table loaded");
        *slot = Some(Arc::new(active));
        Ok(())
    }

    pub fn unload_table(&self) {
        let mut slot = self
            .shared
            .table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = None;
    }

    pub fn record_count(&self) -> usize {
        self.shared
            .active_table()
            .map_or(0, |table| table.records.len())
    }

    /// Administratively disables a run of records in the active table.
    pub fn disable_records(&self, start: usize, count: usize) -> Result<(), EngineError> {
        let table = self.shared.active_table().ok_or(EngineError::NoTableLoaded)?;
        table.disable_records(start, count);
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        self.shared.counters.snapshot(
            self.shared.registry.len(),
            self.shared.registry.enabled_count(),
            self.record_count(),
        )
    }

    // ========================================================================
    // Per-object administration
    // ========================================================================

    pub fn enable_object(&self, id: ObjectId, class: ObjectClass) {
        self.shared.registry.enable(id, class);
    }

    /// Disables one object and marks its held delays for release; the object
    /// is reclaimed once its last in-flight operation completes.
    pub fn disable_object(&self, id: ObjectId) -> Result<(), EngineError> {
        if self.shared.registry.disable(id) {
            self.delay.cancel_matching(|payload| payload.object_id() == id);
            Ok(())
        } else {
            Err(EngineError::ObjectNotFound { id })
        }
    }

    /// Force removal; refuses while the object still has operations in
    /// flight.
    pub fn remove_object(&self, id: ObjectId) -> Result<(), EngineError> {
        self.shared
            .registry
            .remove(id)
            .map_err(|in_progress| EngineError::ObjectBusy { id, in_progress })
    }

    pub fn set_edge_hooks(&self, id: ObjectId, hooks: PositionBitmask) -> Result<(), EngineError> {
        self.with_object(id, |object| object.set_edge_hooks(hooks))
    }

    pub fn set_lba_offset(&self, id: ObjectId, offset: Lba) -> Result<(), EngineError> {
        self.with_object(id, |object| object.set_lba_offset(offset))
    }

    pub fn set_degraded_positions(
        &self,
        id: ObjectId,
        degraded: PositionBitmask,
    ) -> Result<(), EngineError> {
        self.with_object(id, |object| object.set_degraded_positions(degraded))
    }

    pub fn set_proactive_copy(&self, id: ObjectId, proactive: bool) -> Result<(), EngineError> {
        self.with_object(id, |object| object.set_proactive_copy(proactive))
    }

    /// Clears the media-error progression for every position of one object.
    pub fn reset_object_media(&self, id: ObjectId) -> Result<(), EngineError> {
        self.with_object(id, InjectionObject::reset_media)
    }

    pub fn object_stats(&self, id: ObjectId) -> Result<ObjectStats, EngineError> {
        self.with_object(id, |object| object.stats())
    }

    fn with_object<T>(
        &self,
        id: ObjectId,
        f: impl FnOnce(&InjectionObject) -> T,
    ) -> Result<T, EngineError> {
        let object = self
            .shared
            .registry
            .find(id)
            .ok_or(EngineError::ObjectNotFound { id })?;
        Ok(f(&object))
    }

    // ========================================================================
    // Delay administration
    // ========================================================================

    /// Marks a pending delay for early release; the worker releases it on
    /// its next wake.
    pub fn cancel_delay(&self, handle: DelayHandle) -> bool {
        self.delay.cancel(handle)
    }

    pub fn pending_delays(&self) -> usize {
        self.delay.len()
    }
}
