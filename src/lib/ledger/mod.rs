pub mod capacity;
pub mod ledger;
pub mod types;
