pub mod agent;
pub mod catalog;
pub mod config;
pub mod context;
pub mod document;
pub mod executor;
pub mod link;
pub mod locator;
pub mod registry;

pub use tabrelay_common::{element, error, instruction, protocol, result, task};
