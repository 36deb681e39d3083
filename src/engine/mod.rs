pub mod builder;
pub mod locks;
pub mod transition;

pub use builder::{validate_graph, ChainBuilder};
pub use locks::ChainLocks;
pub use transition::TransitionEngine;
