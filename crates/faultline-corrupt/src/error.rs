//! Precondition failures inside the corruption engine. Each aborts only the
//! sector being corrupted; the dispatcher logs it and moves on without
//! touching anything out of range.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorruptionError {
    #[error("symbol index {symbol} does not fit the sector")]
    SymbolOutOfRange { symbol: u32 },

    #[error("bit range [{start_bit}, {start_bit}+{num_bits}) exceeds target size {target_size}")]
    BitRangeOutOfBounds {
        start_bit: u32,
        num_bits: u32,
        target_size: u32,
    },

    #[error("record is missing resolved bit parameters")]
    MissingBitParams,

    #[error("invalidated sector already carries detectable test word {word:#010x}")]
    TestWordConflict { word: u32 },

    #[error("injection left the target value unchanged")]
    ValueUnchanged,

    #[error("{err_type} does not corrupt sector contents")]
    NotABufferType { err_type: &'static str },

    #[error("position {position} exceeds array width {width}")]
    PositionOutOfRange { position: u32, width: u32 },
}
