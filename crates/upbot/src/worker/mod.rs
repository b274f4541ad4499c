//! Worker side of the pipeline: claim jobs, call the Probe Service, persist
//! results, ack.

pub mod consumer;
pub mod probe;

pub use consumer::{BatchReport, Worker, WorkerOptions};
pub use probe::{HttpProbeClient, ProbeCheck, ProbeRegion, ProbeRequest, ProbeResponse, ProbeService};
