//! Refcounted lock table
//!
//! Named counters used to signal contention over resources. Acquiring never
//! blocks; every count change is broadcast so remote observers can tell which
//! keys are busy. Mutual exclusion, where needed, is layered on top by
//! inspecting counts (see [`ReadWriteLock`]).

mod rwlock;
mod singleton;
mod table;

pub use rwlock::{ReadGuard, ReadWriteLock, WriteGuard, read_many, write_many};
pub use singleton::{Singleton, SingletonError};
pub use table::{DEFAULT_LOCK_EVENT_CAPACITY, LockChange, LockGuard, LockTable};
