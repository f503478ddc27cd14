// src/types/mod.rs

pub mod common;
pub mod date;
pub mod value;

pub use common::{FileField, ParseRelation, Pointer};
pub use date::ParseDate;
pub use value::ParseValue;
