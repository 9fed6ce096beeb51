pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod proto_utils;
pub mod suffix_tree;
pub mod watcher;

#[cfg(test)]
mod test_packets;
