//! Runtime utilities.
//!
//! The [`Executor`] is used to spawn the tasks of a call:
//! the server call driver and the handler task it starts.

mod executor;
pub use executor::Executor;
