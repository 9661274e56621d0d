// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod cluster;
pub mod keys;
pub mod memoize;
pub mod policy;
pub mod utils;

pub use utils::*;
