//! CLI integration tests for `strata build`.

mod common;
