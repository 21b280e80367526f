//! VTODO generation and parsing.
//!
//! This module converts tasks to and from calendar objects according to RFC 5545.

mod generate;
mod parse;
pub mod priority;
pub mod recurrence;
mod todo;

pub use generate::{EncodeOptions, generate_todo};
pub use parse::parse_todo;
pub use todo::RemoteTodo;
