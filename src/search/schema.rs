//! Search filter and result record types.

pub mod data;
pub mod query;
