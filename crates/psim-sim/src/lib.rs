//! Components E and F: the flow/compute runtime and the global simulator
//! loop that drives protocol DAGs to completion over a topology.

pub mod history;
pub mod runtime;
pub mod simulator;

pub use history::HistoryEntry;
pub use simulator::{SimRunError, Simulator};
