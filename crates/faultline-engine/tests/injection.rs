//! End-to-end dispatch tests: a configured engine, real requests through
//! pre-send and completion, assertions on status, buffers, and counters.

use std::sync::Mutex;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use faultline_engine::{
    CompletionOutcome, DelayedPayload, Engine, EngineConfig, EngineError, PreSendOutcome,
    ReleaseReason,
};
use faultline_table::{
    Correctness, ErrorMode, ErrorRecord, ErrorTable, ErrorType, TableFlags, TableScope,
};
use faultline_types::{
    BlockRequest, BlockStatus, ObjectClass, ObjectId, Opcode, PositionBitmask, Sector,
    StatusQualifier,
};

const OBJ: ObjectId = ObjectId::new(1);

fn flags() -> TableFlags {
    TableFlags {
        correctness: Correctness::Uncorrectable,
        scope: TableScope::AllRaidTypes,
    }
}

fn record(err_type: ErrorType, err_mode: ErrorMode) -> ErrorRecord {
    ErrorRecord::new(PositionBitmask::new(0b0001), 100, 10, err_type, err_mode)
}

fn engine_with(records: Vec<ErrorRecord>) -> Engine {
    let engine = Engine::new(EngineConfig::default());
    engine.enable();
    engine.enable_object(OBJ, ObjectClass::RaidGroup);
    engine.load_table(ErrorTable::new(flags(), records)).unwrap();
    engine
}

/// Drives one request through both dispatch passes.
fn run(engine: &Engine, request: BlockRequest) -> BlockRequest {
    match engine.pre_send(request) {
        PreSendOutcome::Continue { request, token } => match engine.complete(request, token) {
            CompletionOutcome::Done(done) => done,
            CompletionOutcome::Delayed(_) => panic!("unexpected delayed completion"),
        },
        PreSendOutcome::CompleteNow { request } => request,
        PreSendOutcome::Delayed { .. } => panic!("unexpected delayed send"),
    }
}

// ==== Media errors ====

#[test]
fn hard_media_error_reports_first_bad_lba() {
    let engine = engine_with(vec![record(ErrorType::HardMedia, ErrorMode::Always)]);

    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 105, 2));
    assert_eq!(done.status.status, BlockStatus::MediaError);
    assert_eq!(done.status.media_error_lba, Some(105));

    // A position outside the record's bitmap passes through untouched.
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 1, 105, 2));
    assert!(done.status.is_success());

    let stats = engine.stats();
    assert_eq!(stats.media_errors_injected, 1);
    assert_eq!(stats.passed_through, 1);
}

#[test]
fn soft_media_error_is_success_with_remap_required() {
    let engine = engine_with(vec![record(ErrorType::SoftMedia, ErrorMode::Always)]);
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 102, 1));
    assert_eq!(done.status.status, BlockStatus::Success);
    assert_eq!(done.status.qualifier, StatusQualifier::RemapRequired);
    assert_eq!(done.status.media_error_lba, Some(102));
}

#[test]
fn write_verify_walks_the_bad_region_then_disables_the_record() {
    let mut rec = record(ErrorType::HardMedia, ErrorMode::InjectUntilRemapped);
    rec.blocks = 2;
    let engine = engine_with(vec![rec]);

    // Establish the bad block at 100.
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 100, 2));
    assert_eq!(done.status.media_error_lba, Some(100));

    // First write-verify: 100 remaps, 101 still fails with data lost.
    let done = run(&engine, BlockRequest::new(Opcode::WriteVerify, OBJ, 0, 100, 10));
    assert_eq!(done.status.status, BlockStatus::MediaError);
    assert_eq!(done.status.qualifier, StatusQualifier::DataLost);
    assert_eq!(done.status.media_error_lba, Some(101));

    // Second write-verify exhausts the region; the record self-disables.
    let done = run(&engine, BlockRequest::new(Opcode::WriteVerify, OBJ, 0, 100, 10));
    assert!(done.status.is_success());

    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 100, 2));
    assert!(done.status.is_success(), "disabled record keeps injecting");

    let stats = engine.object_stats(OBJ).unwrap();
    assert_eq!(stats.write_remaps, 2);
}

#[test]
fn plain_write_never_takes_media_or_corruption() {
    let engine = engine_with(vec![
        record(ErrorType::HardMedia, ErrorMode::Always),
        record(ErrorType::Crc, ErrorMode::Always),
    ]);
    let done = run(&engine, BlockRequest::new(Opcode::Write, OBJ, 0, 100, 4));
    assert!(done.status.is_success());
    assert!(done.sectors.iter().all(faultline_types::Sector::crc_is_valid));
}

// ==== Buffer corruption ====

#[test]
fn count_mode_corrupts_exactly_n_reads() {
    let engine = engine_with(vec![
        record(ErrorType::Crc, ErrorMode::Count).with_limits(2, 0),
    ]);
    let mut corrupted = 0;
    for _ in 0..6 {
        let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 100, 1));
        if !done.sectors[0].crc_is_valid() {
            corrupted += 1;
        }
    }
    assert_eq!(corrupted, 2);
    assert_eq!(engine.stats().errors_injected, 2);
}

#[test]
fn corruption_is_confined_to_the_record_range() {
    let engine = engine_with(vec![record(ErrorType::Crc, ErrorMode::Always)]);
    // Request 95..=114 overlaps the record range 100..=109 in the middle.
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 95, 20));
    for (i, sector) in done.sectors.iter().enumerate() {
        let lba = 95 + i as u64;
        let in_range = (100..110).contains(&lba);
        assert_eq!(!sector.crc_is_valid(), in_range, "lba {lba}");
    }
}

#[test]
fn spare_objects_reject_stamp_faults_until_proactive_copy() {
    let engine = Engine::new(EngineConfig::default());
    engine.enable();
    engine.enable_object(OBJ, ObjectClass::Spare);
    engine
        .load_table(ErrorTable::new(
            flags(),
            vec![record(ErrorType::WriteStamp, ErrorMode::Always)],
        ))
        .unwrap();

    let pristine = Sector::with_seed(100);
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 100, 1));
    assert_eq!(done.sectors[0], pristine);

    engine.set_proactive_copy(OBJ, true).unwrap();
    // Copy reads inject on every other read, starting with the first.
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 100, 1));
    assert_eq!(done.sectors[0].time_stamp, 0x7FFF);
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 100, 1));
    assert_eq!(done.sectors[0], pristine);
}

// ==== Encryption and pre-send failures ====

#[test]
fn key_error_fails_the_read() {
    let engine = engine_with(vec![record(ErrorType::KeyError, ErrorMode::Always)]);
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 100, 1));
    assert_eq!(done.status.status, BlockStatus::IoFailed);
    assert_eq!(done.status.qualifier, StatusQualifier::KeyWrapError);
}

#[test]
fn timeout_error_completes_the_write_without_sending() {
    let engine = engine_with(vec![record(ErrorType::TimeoutError, ErrorMode::Always)]);
    let outcome = engine.pre_send(BlockRequest::new(Opcode::Write, OBJ, 0, 100, 4));
    let PreSendOutcome::CompleteNow { request } = outcome else {
        panic!("expected CompleteNow");
    };
    assert_eq!(request.status.status, BlockStatus::IoFailed);
    assert_eq!(request.status.qualifier, StatusQualifier::Unexpected);
    assert_eq!(engine.stats().requests_failed, 1);
}

#[test]
fn silent_drop_reports_success_without_sending() {
    let engine = engine_with(vec![record(ErrorType::SilentDrop, ErrorMode::Always)]);
    let outcome = engine.pre_send(BlockRequest::new(Opcode::Write, OBJ, 0, 100, 4));
    let PreSendOutcome::CompleteNow { request } = outcome else {
        panic!("expected CompleteNow");
    };
    assert!(request.status.is_success());
    assert_eq!(engine.stats().requests_dropped, 1);
}

#[test]
fn incomplete_write_shrinks_then_fails_on_completion() {
    let engine = engine_with(vec![record(ErrorType::IncompleteWrite, ErrorMode::Always)]);
    let outcome = engine.pre_send(BlockRequest::new(Opcode::Write, OBJ, 0, 100, 4));
    let PreSendOutcome::Continue { request, token } = outcome else {
        panic!("expected Continue");
    };
    assert_eq!(request.blocks, 3);
    assert_eq!(request.sectors.len(), 3);

    let CompletionOutcome::Done(done) = engine.complete(request, token) else {
        panic!("expected Done");
    };
    assert_eq!(done.blocks, 4);
    assert_eq!(done.sectors.len(), 4);
    assert_eq!(done.status.status, BlockStatus::IoFailed);
    assert_eq!(done.status.qualifier, StatusQualifier::RetryNotPossible);
}

// ==== Delays ====

fn delayed_engine(records: Vec<ErrorRecord>, poll: Duration) -> (Engine, mpsc::Receiver<(DelayedPayload, ReleaseReason)>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let engine = Engine::with_sink(
        EngineConfig::default().with_poll_interval(poll),
        Box::new(move |payload, reason| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send((payload, reason));
            }
        }),
    );
    engine.enable();
    engine.enable_object(OBJ, ObjectClass::RaidGroup);
    engine.load_table(ErrorTable::new(flags(), records)).unwrap();
    (engine, rx)
}

#[test]
fn delay_down_holds_the_send_for_the_configured_time() {
    let rec = record(ErrorType::DelayDown, ErrorMode::Always).with_limits(50, 0);
    let (engine, rx) = delayed_engine(vec![rec], Duration::from_millis(10));

    let start = Instant::now();
    let outcome = engine.pre_send(BlockRequest::new(Opcode::Write, OBJ, 0, 100, 1));
    assert!(matches!(outcome, PreSendOutcome::Delayed { .. }));
    assert_eq!(engine.pending_delays(), 1);

    let (payload, reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = start.elapsed();
    assert_eq!(reason, ReleaseReason::Expired);
    assert!(elapsed >= Duration::from_millis(50), "released after {elapsed:?}");

    // Resume the held send.
    let DelayedPayload::Send { request, token } = payload else {
        panic!("expected a held send");
    };
    let CompletionOutcome::Done(done) = engine.complete(request, token) else {
        panic!("expected Done");
    };
    assert!(done.status.is_success());
    assert_eq!(engine.stats().requests_delayed, 1);
}

#[test]
fn cancelled_delay_releases_on_the_next_wake() {
    let rec = record(ErrorType::DelayDown, ErrorMode::Always).with_limits(60_000, 0);
    let (engine, rx) = delayed_engine(vec![rec], Duration::from_millis(10));

    let outcome = engine.pre_send(BlockRequest::new(Opcode::Write, OBJ, 0, 100, 1));
    let PreSendOutcome::Delayed { handle } = outcome else {
        panic!("expected Delayed");
    };
    assert!(engine.cancel_delay(handle));
    let (payload, reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reason, ReleaseReason::Cancelled);
    let DelayedPayload::Send { request, token } = payload else {
        panic!("expected a held send");
    };
    // A cancelled release resumes immediately.
    assert!(matches!(
        engine.complete(request, token),
        CompletionOutcome::Done(_)
    ));
}

#[test]
fn disabling_the_object_releases_its_held_send() {
    let rec = record(ErrorType::DelayDown, ErrorMode::Always).with_limits(60_000, 0);
    let (engine, rx) = delayed_engine(vec![rec], Duration::from_millis(10));

    let outcome = engine.pre_send(BlockRequest::new(Opcode::Write, OBJ, 0, 100, 1));
    assert!(matches!(outcome, PreSendOutcome::Delayed { .. }));

    engine.disable_object(OBJ).unwrap();
    let (payload, reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reason, ReleaseReason::Cancelled);
    let DelayedPayload::Send { request, token } = payload else {
        panic!("expected a held send");
    };
    // The resumed send still discharges cleanly against the disabled object.
    assert!(matches!(
        engine.complete(request, token),
        CompletionOutcome::Done(_)
    ));
}

#[test]
fn delay_up_defers_the_completion() {
    let rec = record(ErrorType::DelayUp, ErrorMode::Always).with_limits(20, 0);
    let (engine, rx) = delayed_engine(vec![rec], Duration::from_millis(10));

    let outcome = engine.pre_send(BlockRequest::new(Opcode::Write, OBJ, 0, 100, 1));
    let PreSendOutcome::Continue { request, token } = outcome else {
        panic!("expected Continue");
    };
    let CompletionOutcome::Delayed(_) = engine.complete(request, token) else {
        panic!("expected a delayed completion");
    };
    let (payload, reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reason, ReleaseReason::Expired);
    assert!(matches!(payload, DelayedPayload::Finished { .. }));
}

// ==== Administration ====

#[test]
fn remove_object_refuses_while_an_operation_is_in_flight() {
    let engine = engine_with(vec![record(ErrorType::Crc, ErrorMode::Always)]);
    let outcome = engine.pre_send(BlockRequest::new(Opcode::Read, OBJ, 0, 100, 1));
    let PreSendOutcome::Continue { request, token } = outcome else {
        panic!("expected Continue");
    };
    assert!(matches!(
        engine.remove_object(OBJ),
        Err(EngineError::ObjectBusy { .. })
    ));
    let _ = engine.complete(request, token);
    engine.remove_object(OBJ).unwrap();
}

#[test]
fn disabled_engine_passes_everything_through() {
    let engine = engine_with(vec![record(ErrorType::HardMedia, ErrorMode::Always)]);
    engine.disable();
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 105, 2));
    assert!(done.status.is_success());
}

#[test]
fn load_table_requires_enable_and_rejects_invalid_tables() {
    let engine = Engine::new(EngineConfig::default());
    let table = ErrorTable::new(flags(), vec![record(ErrorType::Crc, ErrorMode::Always)]);
    assert!(matches!(
        engine.load_table(table.clone()),
        Err(EngineError::NotEnabled)
    ));

    engine.enable();
    engine.load_table(table).unwrap();
    // Zero-block record: activation fails, previous table stays.
    let mut bad = record(ErrorType::Crc, ErrorMode::Always);
    bad.blocks = 0;
    assert!(engine.load_table(ErrorTable::new(flags(), vec![bad])).is_err());
    assert_eq!(engine.record_count(), 1);
}

#[test]
fn table_loads_from_json_fixture() {
    let json = r#"{
        "flags": { "correctness": "uncorrectable", "scope": "all_raid_types" },
        "records": [{
            "pos_bitmap": 1,
            "width": 0,
            "lba": 100,
            "blocks": 10,
            "err_type": "hard_media",
            "err_mode": "always",
            "err_limit": 1,
            "skip_limit": 0,
            "bit_adjacent": "yes",
            "crc_detectable": "yes"
        }]
    }"#;
    let table = ErrorTable::from_json(json).unwrap();
    let engine = Engine::new(EngineConfig::default());
    engine.enable();
    engine.enable_object(OBJ, ObjectClass::RaidGroup);
    engine.load_table(table).unwrap();
    let done = run(&engine, BlockRequest::new(Opcode::Read, OBJ, 0, 105, 2));
    assert_eq!(done.status.media_error_lba, Some(105));
}
