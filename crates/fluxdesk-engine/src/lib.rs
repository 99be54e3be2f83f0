pub mod artifacts;
pub mod batch;
pub mod cancel;
pub mod controller;
pub mod flux;
pub mod generation;
mod http;
pub mod refine;

#[cfg(test)]
mod testing;

pub use artifacts::{ArtifactFetcher, HttpFetcher, TempArtifact};
pub use batch::{process_batch, BatchProgress};
pub use cancel::CancelToken;
pub use controller::{
    BatchItemReport, GenerationOptions, JobController, JobObserver, JobServices, JobSpec,
};
pub use flux::FluxClient;
pub use generation::{run_generation, GenerationApi, PollHandle, PollOutcome, PollSettings};
pub use refine::{RefineOptions, RefinementApi, StabilityRefiner};
