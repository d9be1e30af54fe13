//! ReportRunner -- scheduled extraction of daily dashboard reports.
//!
//! This crate drives a browser through a closed reporting dashboard for a
//! set of configured tenants, downloads each tenant's daily report export,
//! and pushes the tabular contents to a spreadsheet sink. Credentials are
//! held encrypted at rest; every attempt lands in an append-only run log.

pub mod artifact;
pub mod config;
pub mod driver;
pub mod engine;
pub mod pipeline;
pub mod retry;
pub mod schedule;
pub mod sink;
pub mod store;
pub mod vault;
