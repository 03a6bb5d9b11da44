//! Shared vocabulary for the braid workspace: ids, message nodes, wire
//! chunks, call frames, and the producer and tool seams.

pub mod errors;
pub mod frame;
pub mod ids;
pub mod messages;
pub mod mock;
pub mod producer;
pub mod settings;
pub mod stream;
pub mod tokens;
pub mod tools;
pub mod wire;
