//! Object table, reference counting, cycle collection and undo.
//!
//! Everything that changes object state goes through [`Heap`], which is
//! what lets the undo log see every mutation.

mod gc;
mod table;
mod undo;

pub use gc::{GcStats, RootProvider};
pub use table::{Heap, HeapError, HeapSettings};
pub use undo::{Change, SavepointId, UndoLog, UndoRecord, UndoSettings};
