//! Engine-level errors. Only administrative calls surface these; the
//! dispatch path degrades to pass-through instead of erroring, so an
//! internal inconsistency can never corrupt unrelated I/O.

use faultline_table::TableError;
use faultline_types::ObjectId;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("object {id} is not registered")]
    ObjectNotFound { id: ObjectId },

    #[error("injection is not enabled")]
    NotEnabled,

    #[error("no error table is loaded")]
    NoTableLoaded,

    #[error("object {id} still has {in_progress} operations in progress")]
    ObjectBusy { id: ObjectId, in_progress: u32 },
}
