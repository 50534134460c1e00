pub mod data;

pub use data::{ParseError, PayloadValue, Reading};
