pub mod mocks;
pub mod strategies;

#[allow(unused_imports)]
pub use mocks::*;
