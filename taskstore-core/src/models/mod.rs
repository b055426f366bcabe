mod context;
mod feedback;
mod task;
mod webhook;

pub use context::*;
pub use feedback::*;
pub use task::*;
pub use webhook::*;
