//! Query construction and assembly.
//!
//! - `template`: structured templates, the `Embed` conversion and the `sql!` macro
//! - `assembler`: linearizes a template tree into `$N` placeholder SQL

pub mod assembler;
pub mod template;

pub use assembler::{AssembledQuery, QueryAssembler};
pub use template::{Embed, Interpolation, Query, Template, TemplateBuilder};
