//! uncommit-policy: run a MySQL database where nothing is ever committed.
//!
//! [`UncommittableHooks`] rewrites client transaction statements onto a
//! savepoint inside a proxy-owned outer transaction that is abandoned when
//! the client disconnects. Tests can point real clients at the proxy and
//! leave the database untouched.

pub mod emulator;
pub mod proxy;

pub use emulator::{Statement, TransactionState, UncommittableHooks};
pub use proxy::UncommittableProxy;
