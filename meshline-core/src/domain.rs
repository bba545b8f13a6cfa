pub mod ids;
pub mod instance;
pub mod partition;
pub mod snapshot;
pub mod span;

pub use ids::*;
pub use instance::*;
pub use partition::*;
pub use snapshot::*;
pub use span::*;
