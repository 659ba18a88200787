pub mod config_store;
pub mod lock;

pub use config_store::{ConfigStore, ConfigStoreError};
pub use lock::{AdvisoryLock, LockError, LockSet};
