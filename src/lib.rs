//! # Grimoire Runtime
//!
//! The Grimoire virtual machine: a cooperative, bytecode-driven runtime
//! with first-class coroutines, deferred blocks, string-typed exceptions,
//! and kind-typed channels with select.
//!
//! Embedding sketch:
//!
//! ```no_run
//! use grimoire_runtime::{primitives, Bytecode, Vm};
//!
//! # fn main() -> Result<(), grimoire_runtime::HostError> {
//! let image = std::fs::read("program.grimb").expect("read bytecode");
//! let mut vm = Vm::new();
//! vm.add_library(&primitives::CORE);
//! vm.load(Bytecode::read(&image)?)?;
//! vm.spawn()?;
//! while vm.has_coroutines() && !vm.is_panicking() {
//!     vm.process();
//! }
//! # Ok(())
//! # }
//! ```

mod bytecode;
mod error;
mod value;
mod vm;

pub use bytecode::{
    decode, fields, signed, word, word2, word_signed, Bytecode, Class, Event, Field, FunctionInfo,
    GlobalCounts, Kind, Opcode, Primitive, Variable,
};
pub use error::{exception, Exception, HostError};
pub use value::{Channel, Obj, Object, Ref};
pub use vm::primitives;
pub use vm::primitives::{Call, Context, Library, PrimitiveFn};
pub use vm::Vm;
