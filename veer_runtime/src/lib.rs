//! A reference managed runtime with a template JIT.
//!
//! This crate hosts the other side of `veer_core`'s seam: a small runtime
//! whose methods are real native code behind real precode stubs, with the
//! reflective surface, prepare facility, and invocation path the
//! redirection machinery expects from a managed host. It exists to be
//! redirected; the integration suites under `tests/` drive `veer_core`
//! against it end to end.

#![deny(unsafe_op_in_unsafe_fn)]

pub mod body;
pub mod exec_mem;
pub mod runtime;
pub mod value;

mod emit;
mod precode;

pub use body::{Body, Helper};
pub use runtime::{
    Exception, Method, MethodSpec, ParamSpec, ReflectionVersion, Runtime, RuntimeConfig, TypeId,
};
pub use value::{Instance, Value};
