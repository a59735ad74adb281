//! Data structures shared by the device controller and packet pipeline:
//! the allowed-IPs trie, the per-keypair replay filter, the session index
//! table and the under-load rate limiter.

pub mod index_table;
pub mod rate_limiter;
pub mod replay;
pub mod trie;

pub use index_table::IndexTable;
pub use rate_limiter::RateLimiter;
pub use replay::ReplayFilter;
pub use trie::AllowedIps;
