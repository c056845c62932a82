//! Kotogawa monitoring service.
//!
//! Ingests dam reservoir, river gauge, and rainfall telemetry from the
//! prefectural observation pages, aligns it to a canonical 10-minute
//! observation clock, and maintains a date-partitioned JSON archive plus
//! a single latest-pointer snapshot for the visualization layer.

pub mod alert;
pub mod archive;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod rollup;
pub mod validate;
