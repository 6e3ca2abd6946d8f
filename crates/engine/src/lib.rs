pub mod capacity;
pub mod ledger;
pub mod pipeline;
pub mod rebalance_bounds;
pub mod session;
pub mod sim;
pub mod submitter;
pub mod watcher;
