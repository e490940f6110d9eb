pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod id_map;
pub mod journal;
pub mod ledger;
pub mod output;
pub mod providers;
pub mod reorganize;
pub mod shard;
pub mod store;
pub mod workflow;
