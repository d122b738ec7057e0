//! room-sniper: watches a bonding-curve room-shares contract for token
//! creations, gates candidates on creator reputation, and trades positions
//! under a strict one-transaction-in-flight discipline.

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod sniper;
pub mod storage;
pub mod trading;

pub use config::Config;
pub use sniper::Sniper;
