#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Observability: internal metrics instruments, handed out explicitly rather than through a
//! process-wide global collector.

pub mod metrics;
