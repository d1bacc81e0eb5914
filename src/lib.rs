//! Compiler and runtime for an LSL-style event-driven scripting language.
//!
//! [`lsl::compile`] turns source text into a [`lsl::module::CompiledModule`];
//! [`runtime::ScriptInstance`] runs it one event at a time, can suspend at
//! checkpoints, and can be serialized mid-handler and resumed elsewhere.

pub mod error;
pub mod logging;
pub mod lsl;
pub mod runtime;
pub mod settings;
