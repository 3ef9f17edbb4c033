//! Run cancellation and guaranteed cleanup.
//!
//! - [`CancellationToken`] carries the run-wide `cancelled` flag and wakes
//!   every task waiting on it.
//! - [`run_with_cleanup`] runs a finalizer after an operation no matter how
//!   the operation ended.
//! - [`cancel_on_interrupt`] wires Ctrl-C to a token.

mod cleanup;
mod token;

pub use cleanup::{cancel_on_interrupt, run_with_cleanup};
pub use token::CancellationToken;
