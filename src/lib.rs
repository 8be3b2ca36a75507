#[macro_use]
extern crate num_derive;

pub mod binary_formats;
pub mod consts;
pub mod debugger;
pub mod memory;

pub use binary_formats::elf::debug_symbols::SymbolTable;
pub use debugger::{
    debugger::{BreakpointHandle, BreakpointInfo, CallbackError, ReadMode, Result, SessionState, TraceError},
    trace_session::{SessionOptions, TraceSession},
};
