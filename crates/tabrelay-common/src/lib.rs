pub mod element;
pub mod error;
pub mod instruction;
pub mod launcher;
pub mod protocol;
pub mod result;
pub mod task;
