//! Coordinator side of tabrelay: per-target instruction queues, the
//! connection registry, the websocket hub contexts attach to, and the
//! dispatch loop that feeds them from the remote task server.

pub mod dispatcher;
pub mod hub;
pub mod identity;
pub mod queue;
pub mod registry;
pub mod task_server;
