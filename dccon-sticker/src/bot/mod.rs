//! Chat front end: command parsing, the update loop and result delivery.

pub mod commands;
mod dispatcher;
mod notifier;

pub use dispatcher::{Dispatcher, UpdateSource, submit_reply};
pub use notifier::{deliver_reports, report_messages};
