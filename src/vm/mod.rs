//! The runtime as the collectors see it: the object model and type metadata
//! produced by the compiler, threads, static roots and thread stacks.

pub mod object_model;
pub mod reference_visitor;
pub mod stack;
pub mod static_roots;
pub mod threads;
pub mod type_descriptor;

pub use self::static_roots::StaticRoots;
pub use self::threads::{ThreadContext, ThreadTable};
pub use self::type_descriptor::TypeDescriptor;
