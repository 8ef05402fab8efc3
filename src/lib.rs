//! Metric namespace flame graphs.
//!
//! Metric name listings from every host of a cluster are folded into one
//! prefix tree per cycle. Snapshots are kept as flat rows in SQLite and
//! served back over HTTP as trimmed trees.

pub mod collector;
pub mod db;
pub mod error;
pub mod flamegraph;
pub mod http_server;
pub mod logging;
pub mod output;
pub mod scheduler;
pub mod settings;
