//! Request dispatch: pre-send interception and post-completion injection.
//!
//! The caller submits every request twice. `pre_send` runs before the
//! request goes downstream and handles the pre-send error types (timeouts,
//! drops, torn writes, delays); `complete` runs on the way back up and
//! applies status and buffer faults. A `Continue` outcome carries an
//! obligation to call `complete` with its token: the object's in-progress
//! count was raised and only the completion lowers it.
//!
//! Internal inconsistency on this path degrades to pass-through. The
//! dispatcher never fails a request it did not deliberately decide to fail.

use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;

use faultline_corrupt::{SectorTarget, corrupt_sector};
use faultline_table::{
    ActiveRecord, ActiveTable, BitParam, Correctness, ErrorMode, ErrorType, ModeInputs, TableScope,
    overlap,
};
use faultline_types::{
    BlockCount, BlockRequest, Lba, MAX_POSITIONS, ObjectClass, ObjectId, Opcode, PositionBitmask,
    RequestStatus, Sector, StatusQualifier,
};

use crate::delay::DelayHandle;
use crate::registry::InjectionObject;
use crate::{Engine, Shared};

// ============================================================================
// Outcomes
// ============================================================================

/// Obligation ticket returned by [`Engine::pre_send`]. An armed token holds
/// the object's in-progress count; the matching [`Engine::complete`] call
/// releases it.
#[derive(Debug)]
pub struct CompletionToken {
    pub(crate) object_id: ObjectId,
    pub(crate) armed: bool,
    /// Request start in table address space; `None` when the range straddles
    /// the wrap boundary (injection suppressed).
    pub(crate) norm_lba: Option<Lba>,
    /// Original block count of a write shrunk by INCOMPLETE_WRITE.
    pub(crate) restore_blocks: Option<BlockCount>,
    /// Delay to apply to the completion (DELAY_UP), in milliseconds.
    pub(crate) delay_up_ms: Option<u32>,
}

impl CompletionToken {
    fn pass_through(object_id: ObjectId) -> Self {
        Self {
            object_id,
            armed: false,
            norm_lba: None,
            restore_blocks: None,
            delay_up_ms: None,
        }
    }
}

/// Disposition of a request on the way down.
#[derive(Debug)]
pub enum PreSendOutcome {
    /// Send the request downstream, then call [`Engine::complete`] with the
    /// token once it finishes.
    Continue {
        request: BlockRequest,
        token: CompletionToken,
    },
    /// Do not send; the request is already finished with this status.
    CompleteNow { request: BlockRequest },
    /// The request is held by the delay queue and will come back through the
    /// release sink.
    Delayed { handle: DelayHandle },
}

/// Disposition of a completed request.
#[derive(Debug)]
pub enum CompletionOutcome {
    Done(BlockRequest),
    /// The finished request is held by the delay queue (DELAY_UP).
    Delayed(DelayHandle),
}

/// What the delay queue holds and eventually hands to the release sink.
#[derive(Debug)]
pub enum DelayedPayload {
    /// A DELAY_DOWN hold: the request has not been sent. The receiver sends
    /// it and calls [`Engine::complete`] with the token.
    Send {
        request: BlockRequest,
        token: CompletionToken,
    },
    /// A DELAY_UP hold: the request is fully processed; deliver it upstream.
    Finished { request: BlockRequest },
}

impl DelayedPayload {
    /// Object the held request belongs to.
    pub fn object_id(&self) -> ObjectId {
        match self {
            Self::Send { request, .. } | Self::Finished { request } => request.object_id,
        }
    }
}

// ============================================================================
// Pre-send
// ============================================================================

impl Engine {
    /// Intercepts a request before it is sent downstream.
    pub fn pre_send(&self, mut request: BlockRequest) -> PreSendOutcome {
        let shared = &self.shared;
        let unarmed = |request: BlockRequest| {
            let object_id = request.object_id;
            PreSendOutcome::Continue {
                request,
                token: CompletionToken::pass_through(object_id),
            }
        };

        if !shared.is_enabled() {
            return unarmed(request);
        }
        let Some(table) = shared.active_table() else {
            return unarmed(request);
        };
        let Some(object) = shared.registry.find(request.object_id) else {
            return unarmed(request);
        };
        if !object.is_enabled() {
            return unarmed(request);
        }
        // A LUN has no array position; everything else honors the hooks.
        if object.class() != ObjectClass::Lun && !object.edge_hooks().contains(request.position) {
            return unarmed(request);
        }

        let adj_lba = request.lba.saturating_sub(object.lba_offset());
        shared.registry.begin_operation(&object);
        let mut token = CompletionToken {
            object_id: request.object_id,
            armed: true,
            norm_lba: table.normalize_lba(adj_lba, request.blocks),
            restore_blocks: None,
            delay_up_ms: None,
        };

        let inputs = mode_inputs(&request);
        let mut delay_down_ms: Option<u32> = None;
        for record in &table.records {
            let err_type = record.current_type();
            if !err_type.is_pre_send() {
                continue;
            }
            // Pre-send matching is raw overlap, no table normalization.
            if !record_filters_pass(record, &request, &object)
                || !overlap(
                    record.params.lba,
                    record.params.blocks,
                    adj_lba,
                    request.blocks,
                )
            {
                continue;
            }
            let behavioral = matches!(err_type, ErrorType::DelayDown | ErrorType::DelayUp);
            if !behavioral && !request.opcode.is_write_class() {
                continue;
            }
            if !shared.decide(record, inputs) {
                continue;
            }

            match err_type {
                ErrorType::TimeoutError => {
                    request.status = RequestStatus::failed(StatusQualifier::Unexpected);
                    request.flags.error_injected = true;
                    shared.count_injection(&object);
                    shared.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
                    shared.registry.end_operation(request.object_id);
                    return PreSendOutcome::CompleteNow { request };
                }
                ErrorType::SilentDrop => {
                    // Lost write: upstream sees success, downstream sees
                    // nothing.
                    request.status = RequestStatus::success();
                    request.flags.error_injected = true;
                    shared.count_injection(&object);
                    shared
                        .counters
                        .requests_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    shared.registry.end_operation(request.object_id);
                    return PreSendOutcome::CompleteNow { request };
                }
                ErrorType::IncompleteWrite => {
                    if request.blocks >= 2 && token.restore_blocks.is_none() {
                        token.restore_blocks = Some(request.blocks);
                        request.blocks -= 1;
                        request.sectors.truncate(request.blocks as usize);
                    }
                }
                ErrorType::DelayDown => {
                    delay_down_ms.get_or_insert(record.params.err_limit);
                }
                ErrorType::DelayUp => {
                    token.delay_up_ms.get_or_insert(record.params.err_limit);
                }
                _ => {}
            }
        }

        if let Some(ms) = delay_down_ms {
            shared
                .counters
                .requests_delayed
                .fetch_add(1, Ordering::Relaxed);
            let hold = Duration::from_millis(u64::from(ms)).min(shared.config.max_delay);
            tracing::debug!(object = %request.object_id, delay_ms = ms, "holding send");
            let handle = self.delay.push(DelayedPayload::Send { request, token }, hold);
            return PreSendOutcome::Delayed { handle };
        }
        PreSendOutcome::Continue { request, token }
    }

    /// Applies post-completion injection and discharges the token.
    pub fn complete(&self, mut request: BlockRequest, token: CompletionToken) -> CompletionOutcome {
        let shared = &self.shared;
        if !token.armed {
            shared
                .counters
                .passed_through
                .fetch_add(1, Ordering::Relaxed);
            return CompletionOutcome::Done(request);
        }
        let Some(object) = shared.registry.find(token.object_id) else {
            // Raced an unregister; benign.
            tracing::debug!(object = %token.object_id, "object gone at completion");
            shared
                .counters
                .passed_through
                .fetch_add(1, Ordering::Relaxed);
            return CompletionOutcome::Done(request);
        };

        let mut injected = false;
        if let Some(original) = token.restore_blocks {
            restore_torn_write(&mut request, original);
            request.status = RequestStatus::failed(StatusQualifier::RetryNotPossible);
            shared.count_injection(&object);
            shared.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
            injected = true;
        } else if shared.is_enabled()
            && object.is_enabled()
            && request.status.is_success()
            && request.opcode.is_injectable()
        {
            injected = shared.inject_on_completion(&mut request, &object, token.norm_lba);
        }
        if injected {
            request.flags.error_injected = true;
        } else {
            shared
                .counters
                .passed_through
                .fetch_add(1, Ordering::Relaxed);
        }

        if let Some(ms) = token.delay_up_ms {
            shared.registry.end_operation(token.object_id);
            shared
                .counters
                .requests_delayed
                .fetch_add(1, Ordering::Relaxed);
            let hold = Duration::from_millis(u64::from(ms)).min(shared.config.max_delay);
            tracing::debug!(object = %request.object_id, delay_ms = ms, "holding completion");
            let handle = self.delay.push(DelayedPayload::Finished { request }, hold);
            return CompletionOutcome::Delayed(handle);
        }
        shared.registry.end_operation(token.object_id);
        CompletionOutcome::Done(request)
    }
}

// ============================================================================
// Post-completion matching
// ============================================================================

impl Shared {
    fn inject_on_completion(
        &self,
        request: &mut BlockRequest,
        object: &InjectionObject,
        norm_lba: Option<Lba>,
    ) -> bool {
        let Some(table) = self.active_table() else {
            return false;
        };
        let Some(norm) = norm_lba else {
            // Wrap straddle; suppressed at pre-send time.
            return false;
        };
        let inputs = mode_inputs(request);
        let mut injected = false;
        for record in &table.records {
            let err_type = record.current_type();
            if err_type == ErrorType::None || err_type.is_pre_send() {
                continue;
            }
            if !completion_class_allows(request.opcode, err_type, record) {
                continue;
            }
            if err_type == ErrorType::CorruptCrc && self.config.ignore_corrupt_crc_data_errors {
                continue;
            }
            if !record_filters_pass(record, request, object)
                || !overlap(record.params.lba, record.params.blocks, norm, request.blocks)
            {
                continue;
            }
            if !spare_allows(self, object, err_type) {
                continue;
            }
            if !correctable_guard_allows(&table, record, request) {
                continue;
            }
            if !copy_read_phase_allows(object, request) {
                continue;
            }
            if !self.decide(record, inputs) {
                continue;
            }

            if err_type.is_media() {
                if self.inject_media(request, object, record, norm, err_type) {
                    injected = true;
                    break;
                }
            } else if err_type.is_encryption() {
                request.status = RequestStatus::failed(encryption_qualifier(err_type));
                self.count_injection(object);
                self.counters.requests_failed.fetch_add(1, Ordering::Relaxed);
                injected = true;
                break;
            } else {
                // Buffer corruption only makes sense on data flowing back up.
                if !request.opcode.is_read_class() {
                    continue;
                }
                if self.corrupt_range(request, object, record, &table, norm) {
                    injected = true;
                }
            }
        }
        injected
    }

    fn inject_media(
        &self,
        request: &mut BlockRequest,
        object: &InjectionObject,
        record: &ActiveRecord,
        norm: Lba,
        err_type: ErrorType,
    ) -> bool {
        let norm_end = norm + request.blocks - 1;
        let bad_start = norm.max(record.params.lba);
        let bad_end = norm_end.min(record.params.end_lba());
        let bad_blocks = bad_end - bad_start + 1;
        let position = request.position as usize;
        if position >= MAX_POSITIONS as usize {
            tracing::warn!(position, "position out of tracker range, skipping");
            return false;
        }

        let write_verify = request.opcode == Opcode::WriteVerify;
        let (inject_at, data_lost) = if write_verify {
            let pin = record.params.err_mode == ErrorMode::InjectSameLba;
            let outcome = {
                let mut state = object.lock_state();
                state.media[position].on_write_verify(bad_start, bad_blocks, norm_end, pin)
            };
            if outcome.remapped {
                object.counters.write_remaps.fetch_add(1, Ordering::Relaxed);
            }
            if outcome.cleared
                && record.params.err_mode == ErrorMode::InjectUntilRemapped
                && outcome.walked_from == Some(record.params.lba)
                && bad_end == record.params.end_lba()
            {
                record.disable_after_remap();
            }
            (outcome.inject, true)
        } else {
            let bad = {
                let mut state = object.lock_state();
                state.media[position].on_read(bad_start, bad_blocks)
            };
            (Some(bad), false)
        };
        let Some(bad) = inject_at else {
            return false;
        };
        if bad < norm || bad > norm_end {
            // The tracker walked outside this request; report nothing.
            tracing::warn!(bad, norm, norm_end, "media LBA outside request range");
            return false;
        }
        let report_lba = request.lba + (bad - norm);

        let soft = match err_type {
            ErrorType::SoftMedia => true,
            ErrorType::HardMedia => false,
            // One in five random media errors is soft.
            _ => self.draw(|rng| rng.gen_range(0..5) == 0),
        };
        request.status = if soft {
            RequestStatus::soft_media_error(report_lba)
        } else {
            let qualifier = if data_lost {
                StatusQualifier::DataLost
            } else {
                StatusQualifier::None
            };
            RequestStatus::hard_media_error(report_lba, qualifier)
        };
        self.count_injection(object);
        self.counters
            .media_errors_injected
            .fetch_add(1, Ordering::Relaxed);
        if !write_verify {
            object
                .counters
                .read_media_errors_injected
                .fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(
            object = %request.object_id,
            lba = report_lba,
            soft,
            err_type = %err_type,
            "injected media error"
        );
        true
    }

    fn corrupt_range(
        &self,
        request: &mut BlockRequest,
        object: &InjectionObject,
        record: &ActiveRecord,
        table: &ActiveTable,
        norm: Lba,
    ) -> bool {
        let raid6 = table.flags.scope == TableScope::Raid6Only;
        let norm_end = norm + request.blocks - 1;
        let start = norm.max(record.params.lba);
        let end = norm_end.min(record.params.end_lba());

        // RAID-6 tables fix the parity layout; all-types tables take it from
        // the request's stripe geometry.
        let parity_positions = if raid6 {
            PositionBitmask::new(0b0011)
        } else {
            request.parity_positions
        };
        let is_parity = parity_positions.contains(request.position);
        let array_width = if record.params.width > request.position {
            record.params.width
        } else {
            request.array_width.max(request.position + 1)
        };

        let position = request.position;
        let mut mutated = false;
        for table_lba in start..=end {
            let seed = request.lba + (table_lba - norm);
            let Some(sector) = request.sector_at_mut(seed) else {
                continue;
            };
            let target = SectorTarget {
                position,
                is_parity,
                array_width,
                parity_bitmask: parity_positions.bits(),
                raid6,
                seed,
            };
            match corrupt_sector(sector, &record.params, &target) {
                Ok(true) => mutated = true,
                Ok(false) => {}
                Err(err) => {
                    // Abort this record's corruption, keep the sector intact.
                    self.counters
                        .corruptions_aborted
                        .fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        lba = seed,
                        err_type = %record.params.err_type,
                        error = %err,
                        "corruption precondition failed"
                    );
                    break;
                }
            }
        }
        if mutated {
            self.count_injection(object);
            tracing::debug!(
                object = %request.object_id,
                lba = request.lba,
                err_type = %record.params.err_type,
                "corrupted sectors"
            );
        }
        mutated
    }

    fn decide(&self, record: &ActiveRecord, inputs: ModeInputs) -> bool {
        self.draw(|rng| record.decide(inputs, rng))
    }

    pub(crate) fn count_injection(&self, object: &InjectionObject) {
        self.counters.errors_injected.fetch_add(1, Ordering::Relaxed);
        object
            .counters
            .errors_injected
            .fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Match predicates
// ============================================================================

fn mode_inputs(request: &BlockRequest) -> ModeInputs {
    ModeInputs {
        retried: request.flags.retried,
        single_region_verify: request.flags.single_region_verify,
    }
}

/// Object, opcode, position, and degraded filters shared by both passes.
fn record_filters_pass(
    record: &ActiveRecord,
    request: &BlockRequest,
    object: &InjectionObject,
) -> bool {
    if let Some(filter) = record.params.object_id {
        if filter != request.object_id {
            return false;
        }
    }
    if let Some(filter) = record.params.opcode {
        if filter != request.opcode {
            return false;
        }
    }
    if object.class() != ObjectClass::Lun {
        if !record.params.pos_bitmap.contains(request.position) {
            return false;
        }
        if object.degraded_positions().contains(request.position) {
            return false;
        }
        // The position must also sit inside the record's adjacency union.
        if !record.params.err_adj.is_empty() && !record.params.err_adj.contains(request.position) {
            return false;
        }
    }
    true
}

/// Opcode-class gate for post-completion types: read-class sees everything,
/// write-verify only media errors, plain writes nothing. Pure coherency
/// faults are only observable under verify.
fn completion_class_allows(opcode: Opcode, err_type: ErrorType, record: &ActiveRecord) -> bool {
    let class_ok = if opcode.is_read_class() {
        true
    } else if opcode == Opcode::WriteVerify {
        err_type.is_media()
    } else {
        false
    };
    class_ok && (!is_coherency_style(err_type, record) || opcode.is_verify_class())
}

/// A fault with a valid checksum is invisible to a plain read; only verify
/// compares against parity and can see it.
fn is_coherency_style(err_type: ErrorType, record: &ActiveRecord) -> bool {
    err_type == ErrorType::Coherency
        || (err_type.is_raid6_bit_level() && record.params.crc_detectable == BitParam::No)
}

/// A hot spare outside a proactive copy only takes CRC-family and media
/// faults.
fn spare_allows(shared: &Shared, object: &InjectionObject, err_type: ErrorType) -> bool {
    if object.class() != ObjectClass::Spare
        || object.is_proactive_copy()
        || shared.config.unrestricted_spare_injection
    {
        return true;
    }
    err_type.is_crc_family() || err_type.is_media()
}

/// Keeps a CORRECTABLE table's faults correctable: a child verify must not
/// push the parent's faulted-position set outside the record's adjacency.
fn correctable_guard_allows(
    table: &ActiveTable,
    record: &ActiveRecord,
    request: &BlockRequest,
) -> bool {
    if table.flags.correctness != Correctness::Correctable
        || !request.flags.has_parent
        || !request.opcode.is_verify_class()
        || request.position >= MAX_POSITIONS
    {
        return true;
    }
    if request.flags.error_injected {
        return false;
    }
    let faulted = PositionBitmask::new(request.flags.parent_faulted_positions as u16);
    if faulted.contains(request.position) {
        // Already intercepted downstream.
        return false;
    }
    faulted
        .union(PositionBitmask::single(request.position))
        .is_subset_of(record.params.err_adj)
}

/// Proactive-copy reads inject on every other read; the phase bit lives on
/// the object.
fn copy_read_phase_allows(object: &InjectionObject, request: &BlockRequest) -> bool {
    if !object.is_proactive_copy() || request.opcode != Opcode::Read {
        return true;
    }
    let mut state = object.lock_state();
    let inject = state.inject_copy_read;
    state.inject_copy_read = !inject;
    inject
}

fn encryption_qualifier(err_type: ErrorType) -> StatusQualifier {
    match err_type {
        ErrorType::KeyError => StatusQualifier::KeyWrapError,
        ErrorType::KeyNotFound => StatusQualifier::KeyNotFound,
        _ => StatusQualifier::EncryptionNotEnabled,
    }
}

fn restore_torn_write(request: &mut BlockRequest, original: BlockCount) {
    request.blocks = original;
    while (request.sectors.len() as u64) < original {
        let lba = request.lba + request.sectors.len() as u64;
        request.sectors.push(Sector::with_seed(lba));
    }
}
