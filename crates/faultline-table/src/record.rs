//! Error-record definitions: the fault taxonomy, the injection modes, and
//! the per-record mode state machine that decides whether a matching request
//! actually injects.

use std::fmt::{self, Display};
use std::sync::Mutex;

use rand::Rng;
use serde::{Deserialize, Serialize};

use faultline_types::{BlockCount, Lba, ObjectId, Opcode, PositionBitmask};

/// Upper bound on the delay a DELAY_DOWN / DELAY_UP record may request.
/// Delay records carry their delay in milliseconds in `err_limit`.
pub const MAX_DELAY_MS: u32 = 120_000;

// ============================================================================
// Taxonomy
// ============================================================================

/// The kind of fault a record injects.
///
/// `None` doubles as the self-disabled state: an INJECT_UNTIL_REMAPPED record
/// whose range has been fully remapped flips its type to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    #[default]
    None,
    // CRC family: deterministic checksum corruption.
    Crc,
    MultiBitCrc,
    MultiBitCrcWithLbaStamp,
    SingleBitCrc,
    KlondikeCrc,
    DhCrc,
    InvalidatedCrc,
    RaidCrc,
    CorruptCrc,
    // Stamp family: metadata-only corruption.
    WriteStamp,
    TimeStamp,
    BogusWriteStamp,
    BogusTimeStamp,
    LbaStamp,
    ShedStamp,
    BogusShedStamp,
    // RAID-6 bit-level symbol corruption.
    OneNs,
    OneS,
    OneR,
    OneD,
    OneCod,
    OneCop,
    OnePoc,
    Coherency,
    // Media errors: status-only, driven by the progression tracker.
    HardMedia,
    SoftMedia,
    RandomMedia,
    // Encryption failures: status-only.
    KeyError,
    KeyNotFound,
    EncryptionNotEnabled,
    // Pre-send behaviors.
    IncompleteWrite,
    SilentDrop,
    TimeoutError,
    DelayDown,
    DelayUp,
}

impl ErrorType {
    pub fn is_media(self) -> bool {
        matches!(self, Self::HardMedia | Self::SoftMedia | Self::RandomMedia)
    }

    pub fn is_crc_family(self) -> bool {
        matches!(
            self,
            Self::Crc
                | Self::MultiBitCrc
                | Self::MultiBitCrcWithLbaStamp
                | Self::SingleBitCrc
                | Self::KlondikeCrc
                | Self::DhCrc
                | Self::InvalidatedCrc
                | Self::RaidCrc
                | Self::CorruptCrc
        )
    }

    /// RAID-6 bit-level types carry symbol/bit-range parameters and are only
    /// legal in raid6-only tables.
    pub fn is_raid6_bit_level(self) -> bool {
        matches!(
            self,
            Self::OneNs | Self::OneS | Self::OneR | Self::OneD | Self::OneCod | Self::OneCop
                | Self::OnePoc
        )
    }

    /// Types whose bit range addresses a 16-bit metadata field rather than a
    /// data symbol.
    pub fn is_sixteen_bit_target(self) -> bool {
        matches!(self, Self::OneCod | Self::OneCop | Self::OnePoc)
    }

    pub fn is_encryption(self) -> bool {
        matches!(
            self,
            Self::KeyError | Self::KeyNotFound | Self::EncryptionNotEnabled
        )
    }

    /// Types handled on the way down, before the request is sent.
    pub fn is_pre_send(self) -> bool {
        matches!(
            self,
            Self::IncompleteWrite | Self::SilentDrop | Self::TimeoutError | Self::DelayDown
                | Self::DelayUp
        )
    }

    /// Types that mutate sector contents (as opposed to status-only types).
    pub fn corrupts_buffer(self) -> bool {
        self != Self::None && !self.is_media() && !self.is_encryption() && !self.is_pre_send()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Crc => "crc",
            Self::MultiBitCrc => "multi_bit_crc",
            Self::MultiBitCrcWithLbaStamp => "multi_bit_crc_with_lba_stamp",
            Self::SingleBitCrc => "single_bit_crc",
            Self::KlondikeCrc => "klondike_crc",
            Self::DhCrc => "dh_crc",
            Self::InvalidatedCrc => "invalidated_crc",
            Self::RaidCrc => "raid_crc",
            Self::CorruptCrc => "corrupt_crc",
            Self::WriteStamp => "write_stamp",
            Self::TimeStamp => "time_stamp",
            Self::BogusWriteStamp => "bogus_write_stamp",
            Self::BogusTimeStamp => "bogus_time_stamp",
            Self::LbaStamp => "lba_stamp",
            Self::ShedStamp => "shed_stamp",
            Self::BogusShedStamp => "bogus_shed_stamp",
            Self::OneNs => "one_ns",
            Self::OneS => "one_s",
            Self::OneR => "one_r",
            Self::OneD => "one_d",
            Self::OneCod => "one_cod",
            Self::OneCop => "one_cop",
            Self::OnePoc => "one_poc",
            Self::Coherency => "coherency",
            Self::HardMedia => "hard_media",
            Self::SoftMedia => "soft_media",
            Self::RandomMedia => "random_media",
            Self::KeyError => "key_error",
            Self::KeyNotFound => "key_not_found",
            Self::EncryptionNotEnabled => "encryption_not_enabled",
            Self::IncompleteWrite => "incomplete_write",
            Self::SilentDrop => "silent_drop",
            Self::TimeoutError => "timeout_error",
            Self::DelayDown => "delay_down",
            Self::DelayUp => "delay_up",
        }
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// When a matching record injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    #[default]
    Always,
    /// Inject while `err_count < err_limit`, then stop.
    Count,
    /// Skip `skip_limit` hits, then switch to [`Self::SkipInsert`].
    Skip,
    /// Inject `err_limit` hits, then switch back to [`Self::Skip`].
    SkipInsert,
    /// Inject with probability `1 / err_limit`.
    Random,
    /// Inject, but never on a retried or single-region-verify request.
    Trans,
    /// With probability `(err_limit - 1) / err_limit` inject outright;
    /// otherwise behave as [`Self::Trans`].
    TransRandom,
    /// Inject every hit until a write-verify walks the record's whole range,
    /// then self-disable.
    InjectUntilRemapped,
    /// Inject every hit; the media tracker pins the bad LBA instead of
    /// advancing it.
    InjectSameLba,
}

impl ErrorMode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Count => "count",
            Self::Skip => "skip",
            Self::SkipInsert => "skip_insert",
            Self::Random => "random",
            Self::Trans => "trans",
            Self::TransRandom => "trans_random",
            Self::InjectUntilRemapped => "inject_until_remapped",
            Self::InjectSameLba => "inject_same_lba",
        }
    }
}

impl Display for ErrorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tri-state bit-level parameter: a concrete yes/no, or "pick at
/// randomize time".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BitParam {
    #[default]
    Rnd,
    Yes,
    No,
}

impl BitParam {
    pub fn is_yes(self) -> bool {
        self == Self::Yes
    }
}

// ============================================================================
// Record
// ============================================================================

/// One fault descriptor in a table.
///
/// `symbol`, `start_bit`, and `num_bits` use `None` to mean "fill in at
/// randomize time"; activation fails if any survive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Positions this record injects on. Empty on a raid6 bit-level record
    /// means "randomize to a legal position".
    pub pos_bitmap: PositionBitmask,
    /// Array width, used to translate positions for raid6-only tables.
    pub width: u32,
    /// Start of the record's range in normalized table address space.
    pub lba: Lba,
    pub blocks: BlockCount,
    pub err_type: ErrorType,
    pub err_mode: ErrorMode,
    /// Injection budget for COUNT/SKIP_INSERT, probability modulus for
    /// RANDOM/TRANS_RND, delay milliseconds for DELAY_DOWN/DELAY_UP.
    pub err_limit: u32,
    pub skip_limit: u32,
    /// Restrict matching to one opcode; `None` matches any.
    #[serde(default)]
    pub opcode: Option<Opcode>,
    /// Restrict matching to one object; `None` matches any.
    #[serde(default)]
    pub object_id: Option<ObjectId>,
    /// Target symbol index for raid6 bit-level types.
    #[serde(default)]
    pub symbol: Option<u32>,
    #[serde(default)]
    pub start_bit: Option<u32>,
    #[serde(default)]
    pub num_bits: Option<u32>,
    #[serde(default)]
    pub bit_adjacent: BitParam,
    #[serde(default)]
    pub crc_detectable: BitParam,
    /// Union of `pos_bitmap` across all records sharing this record's LBA
    /// range. Derived; recomputed whenever the table changes.
    #[serde(default)]
    pub err_adj: PositionBitmask,
}

impl ErrorRecord {
    pub fn new(
        pos_bitmap: PositionBitmask,
        lba: Lba,
        blocks: BlockCount,
        err_type: ErrorType,
        err_mode: ErrorMode,
    ) -> Self {
        Self {
            pos_bitmap,
            width: 0,
            lba,
            blocks,
            err_type,
            err_mode,
            err_limit: 1,
            skip_limit: 0,
            opcode: None,
            object_id: None,
            symbol: None,
            start_bit: None,
            num_bits: None,
            bit_adjacent: BitParam::Yes,
            crc_detectable: BitParam::Yes,
            err_adj: PositionBitmask::EMPTY,
        }
    }

    pub fn with_limits(mut self, err_limit: u32, skip_limit: u32) -> Self {
        self.err_limit = err_limit;
        self.skip_limit = skip_limit;
        self
    }

    pub fn with_opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = Some(opcode);
        self
    }

    pub fn with_object(mut self, object_id: ObjectId) -> Self {
        self.object_id = Some(object_id);
        self
    }

    pub fn with_width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    pub fn with_bits(mut self, symbol: u32, start_bit: u32, num_bits: u32) -> Self {
        self.symbol = Some(symbol);
        self.start_bit = Some(start_bit);
        self.num_bits = Some(num_bits);
        self
    }

    pub fn with_bit_params(mut self, bit_adjacent: BitParam, crc_detectable: BitParam) -> Self {
        self.bit_adjacent = bit_adjacent;
        self.crc_detectable = crc_detectable;
        self
    }

    pub fn end_lba(&self) -> Lba {
        self.lba + self.blocks - 1
    }
}

// ============================================================================
// Mode state machine
// ============================================================================

/// Mutable per-record state, guarded by its own lock so concurrent
/// dispatchers keep COUNT exactness.
#[derive(Debug, Clone)]
pub struct ModeState {
    pub err_mode: ErrorMode,
    /// Current type; flips to [`ErrorType::None`] when the record
    /// self-disables.
    pub err_type: ErrorType,
    pub err_count: u32,
    pub skip_count: u32,
}

/// Request-side inputs to the mode decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeInputs {
    pub retried: bool,
    pub single_region_verify: bool,
}

/// A record activated for dispatch: immutable parameters plus locked state.
#[derive(Debug)]
pub struct ActiveRecord {
    pub params: ErrorRecord,
    state: Mutex<ModeState>,
}

impl ActiveRecord {
    pub fn new(params: ErrorRecord) -> Self {
        let state = ModeState {
            err_mode: params.err_mode,
            err_type: params.err_type,
            err_count: 0,
            skip_count: 0,
        };
        Self {
            params,
            state: Mutex::new(state),
        }
    }

    /// Current error type, honoring self-disable.
    pub fn current_type(&self) -> ErrorType {
        self.lock().err_type
    }

    pub fn err_count(&self) -> u32 {
        self.lock().err_count
    }

    /// Administrative disable: the record stops matching but keeps its slot.
    pub fn disable(&self) {
        self.lock().err_type = ErrorType::None;
    }

    /// Self-disable after a full remap walk (INJECT_UNTIL_REMAPPED).
    pub fn disable_after_remap(&self) {
        let mut state = self.lock();
        tracing::debug!(
            lba = self.params.lba,
            blocks = self.params.blocks,
            "record range fully remapped, disabling"
        );
        state.err_type = ErrorType::None;
    }

    /// Advances the mode state machine for one matching request and reports
    /// whether to inject.
    ///
    /// Counters only move on a hit that reaches this point, so COUNT
    /// exactness holds: a COUNT record with `err_limit = N` injects exactly
    /// its first N hits.
    pub fn decide<R: Rng>(&self, inputs: ModeInputs, rng: &mut R) -> bool {
        let mut state = self.lock();
        let limits = (self.params.err_limit, self.params.skip_limit);
        match state.err_mode {
            ErrorMode::Always | ErrorMode::InjectUntilRemapped | ErrorMode::InjectSameLba => {
                state.err_count += 1;
                true
            }
            ErrorMode::Count => {
                if state.err_count >= limits.0 {
                    false
                } else {
                    state.err_count += 1;
                    true
                }
            }
            ErrorMode::Trans => Self::decide_trans(&mut state, inputs),
            ErrorMode::TransRandom => {
                let modulus = limits.0.max(1);
                if rng.gen_range(0..modulus) != 0 {
                    state.err_count += 1;
                    true
                } else {
                    // Fall through to the transitory path.
                    Self::decide_trans(&mut state, inputs)
                }
            }
            ErrorMode::Skip => {
                state.skip_count += 1;
                if state.skip_count >= limits.1 {
                    state.skip_count = 0;
                    state.err_mode = ErrorMode::SkipInsert;
                }
                false
            }
            ErrorMode::SkipInsert => {
                state.err_count += 1;
                state.skip_count += 1;
                if state.skip_count >= limits.0 {
                    state.skip_count = 0;
                    state.err_mode = ErrorMode::Skip;
                }
                true
            }
            ErrorMode::Random => {
                let modulus = limits.0.max(1);
                if rng.gen_range(0..modulus) == 0 {
                    state.err_count += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn decide_trans(state: &mut ModeState, inputs: ModeInputs) -> bool {
        if inputs.retried || inputs.single_region_verify {
            // A retry must succeed; do not re-inject.
            false
        } else {
            state.err_count += 1;
            true
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ModeState> {
        // A poisoned record lock means a panic mid-decision; the state is a
        // pair of counters, safe to keep using.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
