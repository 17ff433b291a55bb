pub mod keys;
pub mod l1;
pub mod tier;

pub use tier::CacheTier;
