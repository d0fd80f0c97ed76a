//! Core data model: tasks, the store contract, and attempt bookkeeping.

pub mod store;
pub mod summary;
pub mod task;
