// Canonical records, level book and the bounded containers every stage uses
pub mod book;
pub mod queue;
pub mod stats;
pub mod types;
