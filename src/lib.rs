pub mod common;
pub mod handler;
pub mod monitor;
pub mod registry;
pub mod router;
pub mod supervisor;

pub use supervisor::{swarm_start, Swarm};
