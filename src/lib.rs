pub mod backend;
pub mod collections;
pub mod error;
pub mod frontend;
#[cfg(feature = "profiler")]
pub mod profiler;
pub mod runtime;

pub use backend::{compile, CompileResult, Compiler};
pub use error::Error;
pub use runtime::{GlobalState, State, Value, Vm, VmConfig};
