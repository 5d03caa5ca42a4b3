pub mod store;

pub use store::{GraphStats, OperandGraph};
