pub mod error;
pub mod input;
