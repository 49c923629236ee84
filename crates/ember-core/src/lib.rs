//! Ember runtime core
//!
//! This crate provides the in-memory substrate an embeddable dynamic-language
//! runtime executes on top of:
//! - Tagged value cells with deterministic reference counting
//! - The hybrid ordered-array/hash-map table backing all composite values
//! - The class / handler-table object model
//! - The paged call-frame stack and its unwinding machinery
//!
//! The lexer, compiler and instruction dispatch loop are external
//! collaborators: they hand this crate immutable [`unit::CodeUnit`]s and drive
//! frames through the [`stack::ValueStack`]. Everything here assumes a single
//! execution context per [`context::Context`]; independent contexts may live
//! on separate threads with no sharing.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod gc;
pub mod heap;
pub mod object;
pub mod stack;
pub mod string;
pub mod table;
pub mod task;
pub mod unit;
pub mod value;

pub use context::{Context, ContextOptions, InterruptHandle};
pub use gc::{enumerate_children, CycleCollector};
pub use heap::{HeapKind, HeapRef, RcHeader};
pub use object::{Class, ClassDesc, Handlers, HandlersBuilder, Instance, PropPurpose, PropQuery};
pub use stack::{Frame, FrameState, Resume, ValueStack};
pub use string::{Interner, StrRef};
pub use table::{Key, SlotRef, Table, TableCursor};
pub use task::{Task, TaskId, TaskSet, TaskState};
pub use unit::{CodeUnit, ProtectedRange};
pub use value::{TypeTag, Value};

/// Runtime execution errors
///
/// Programming-contract violations (retain on a dead object, stale slot use)
/// are not represented here; they panic. Structural absence (missing key,
/// missing property) is an `Option`/`bool`, never an error. This enum covers
/// the remaining failure classes: raised exceptions and resource exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Call stack exceeded its configured slot budget
    #[error("stack overflow")]
    StackOverflow,

    /// Frame operation with no frame on the stack
    #[error("no active call frame")]
    NoFrame,

    /// Class failed validation at linkage time
    #[error("invalid class `{0}`: {1}")]
    InvalidClass(String, String),

    /// A raised value unwound past the outermost frame
    #[error("unhandled exception")]
    Unhandled(value::Value),

    /// Execution was interrupted via the polled flag
    #[error("execution interrupted")]
    Interrupted,

    /// Type error
    #[error("type error: {0}")]
    TypeError(String),

    /// Other runtime error
    #[error("runtime error: {0}")]
    Runtime(String),
}

/// Runtime execution result
pub type RuntimeResult<T> = Result<T, RuntimeError>;
