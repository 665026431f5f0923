pub mod client;
pub mod error;

pub use client::{index_key, user_entry_key, worker_entry_key, EntryUpdate, KvClient};
pub use error::KvError;
