//! # Faultline
//!
//! A fault-injection engine for block-storage RAID stacks. Test harnesses
//! configure tables of synthetic error conditions (checksum corruption,
//! stamp mismatches, media errors, delays, torn writes) and route their I/O
//! through an [`Engine`] to validate the error-handling and recovery logic
//! of the layers above.
//!
//! ```
//! use faultline::{
//!     BlockRequest, CompletionOutcome, Correctness, Engine, EngineConfig, ErrorMode, ErrorRecord,
//!     ErrorTable, ErrorType, ObjectClass, ObjectId, Opcode, PositionBitmask, PreSendOutcome,
//!     TableFlags, TableScope,
//! };
//!
//! let engine = Engine::new(EngineConfig::default());
//! engine.enable();
//! engine.enable_object(ObjectId::new(1), ObjectClass::RaidGroup);
//!
//! let record = ErrorRecord::new(
//!     PositionBitmask::new(0b0001),
//!     100,
//!     10,
//!     ErrorType::HardMedia,
//!     ErrorMode::Always,
//! );
//! let flags = TableFlags {
//!     correctness: Correctness::Uncorrectable,
//!     scope: TableScope::AllRaidTypes,
//! };
//! engine.load_table(ErrorTable::new(flags, vec![record])).unwrap();
//!
//! let request = BlockRequest::new(Opcode::Read, ObjectId::new(1), 0, 105, 2);
//! let PreSendOutcome::Continue { request, token } = engine.pre_send(request) else {
//!     unreachable!();
//! };
//! let CompletionOutcome::Done(done) = engine.complete(request, token) else {
//!     unreachable!();
//! };
//! assert_eq!(done.status.media_error_lba, Some(105));
//! ```

pub use faultline_corrupt::{CorruptionError, InvalidReason, SectorTarget, corrupt_sector};
pub use faultline_engine::{
    CompletionOutcome, CompletionToken, DelayHandle, DelayedPayload, Engine, EngineConfig,
    EngineError, EngineStats, ObjectStats, PreSendOutcome, ReleaseReason,
};
pub use faultline_table::{
    ActiveTable, BitParam, Correctness, ErrorMode, ErrorRecord, ErrorTable, ErrorType,
    MAX_DELAY_MS, TableError, TableFlags, TableScope, ValidateOptions, overlap,
};
pub use faultline_types::{
    BlockCount, BlockRequest, BlockStatus, Lba, ObjectClass, ObjectId, Opcode, PositionBitmask,
    RaidGeometry, RequestStatus, Sector, StatusQualifier, checksum_of,
};
