//! # faultline-table: Error-record tables for the Faultline engine
//!
//! A table is an ordered sequence of [`ErrorRecord`] fault descriptors plus
//! [`TableFlags`] declaring its correctness class and scope. Tables are
//! built (or loaded from JSON fixtures), randomized, validated, and then
//! activated into an [`ActiveTable`] whose per-record mode state machines
//! the dispatcher drives.
//!
//! Key invariants:
//! - `err_adj` on every record equals the union of position bitmaps across
//!   records sharing its LBA range, recomputed on activation.
//! - An invalid table never activates; validation names the offending
//!   record and field.
//! - The table address space wraps at `max_lba`; requests straddling the
//!   wrap boundary are excluded from matching entirely.

mod error;
mod randomize;
mod record;
mod table;
mod validate;

pub use error::TableError;
pub use randomize::randomize;
pub use record::{
    ActiveRecord, BitParam, ErrorMode, ErrorRecord, ErrorType, MAX_DELAY_MS, ModeInputs,
    ModeState,
};
pub use table::{
    ActiveTable, CHUNK_SIZE, Correctness, ErrorTable, MAX_LBA_GAP, TableFlags, TableScope,
    overlap,
};
pub use validate::{ValidateOptions, validate};
