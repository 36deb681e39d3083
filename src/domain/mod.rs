pub mod chain;
pub mod event;
pub mod order;

pub use chain::*;
pub use event::*;
pub use order::*;
