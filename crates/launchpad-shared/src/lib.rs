pub mod constants;
pub mod error;
pub mod rows;
pub mod types;
