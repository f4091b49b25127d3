//! SQLite persistence for targets, runs, phase records and findings.

pub mod db;
pub mod models;

pub use db::{Admission, DbHandle, Store};
