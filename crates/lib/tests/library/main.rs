//! Integration tests for strata-lib: whole plans run through the executor.

mod common;

mod plan_tests;

#[cfg(unix)]
mod cache_tests;
