//! Small helpers shared across components

pub mod error_context;

pub use error_context::{OptionContext, ResultContext};
