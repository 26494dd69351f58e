pub mod feedback;
pub mod proposal;
pub mod task;
pub mod workflow;

pub use feedback::*;
pub use proposal::*;
pub use task::*;
pub use workflow::*;
