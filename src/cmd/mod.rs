//! Command-line argument structs, one module per binary.

pub mod launch;
pub mod operator;
pub mod worker;
