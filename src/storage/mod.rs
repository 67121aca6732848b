//! Storage for the principal graph.
//!
//! The traits describe the transactional contract the engine relies on; the
//! in-memory backend implements it for embedded use and tests.

mod locks;
mod memory;
mod traits;

pub use locks::{PrincipalLockGuard, PrincipalLocks};
pub use memory::InMemoryIdentityStore;
pub use traits::{IdentityStore, StorageError, StoreTransaction};
