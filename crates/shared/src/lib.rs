#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PageCraft Shared Types and Utilities
//!
//! This crate contains types, errors, and utilities shared across the PageCraft platform.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
