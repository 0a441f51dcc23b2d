pub mod combinators;
pub mod error;
pub mod future;
pub mod generator;

// Re-export commonly used items
pub use combinators::{needs_all, needs_any, repeat};
pub use error::{CATEGORY, Failure, FutureError};
pub use future::{ErrorBranch, Future, make_future, resolved_future};
pub use generator::{Generator, foreach};
