//! Chromium host for tabrelay execution contexts.
//!
//! [`CdpDocument`](document::CdpDocument) implements the engine's document
//! seam over CDP through a small page-side bridge, and
//! [`ChromeLauncher`](launcher::ChromeLauncher) opens pages on demand for
//! the dispatcher's `spawnTarget` task.

pub mod cdp;
pub mod document;
pub mod launcher;
