pub mod core;
pub mod csr;
pub mod decoder;
pub mod execution;
pub mod types;

pub use core::Hart;
pub use types::{Mode, Trap, Width};
