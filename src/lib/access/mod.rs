pub mod access;
pub mod types;
