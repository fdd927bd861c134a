// Market data stages: sources feed extractors, filters, processors and updaters
pub mod adapters;   // connection sources and their producer handles
pub mod extractor;  // raw payload -> extracted message info
pub mod filter;     // admission, dedup and ordering
pub mod normaliser; // numeric and pair-name normalisation helpers
pub mod processor;  // extracted info -> canonical records
pub mod router;     // drives the graph on a timer
pub mod updater;    // sequencing, conflicts and recovery per pair
