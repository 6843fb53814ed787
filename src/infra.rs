pub mod cache;
pub mod memory;
pub mod postgres;
