#![allow(unused_crate_dependencies)] // false positives because there is both a library and a test binary

//! Integration Tests (IT)
//!
//! Integration tests are all contained in this single crate, and organized
//! in modules. This is to prevent `rustc` to re-link the library crates
//! with each of the integration tests (one for each *.rs file / test crate
//! under the `tests/` folder), while cargo still runs all tests from the
//! single binary in parallel.

mod echo;
mod lifecycle;
