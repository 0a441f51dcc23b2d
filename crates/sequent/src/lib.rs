pub use sequent_core::{
    combinators::{needs_all, needs_any, repeat},
    error::{CATEGORY, Failure, FutureError},
    future::{ErrorBranch, Future, make_future, resolved_future},
    generator::{Generator, foreach},
};

pub mod prelude {
    pub use super::*;
}
