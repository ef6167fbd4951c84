mod http;
mod memory;
mod model;
mod store;

pub use http::HttpJobStore;
pub use memory::MemoryJobStore;
pub use model::{
    BackgroundLayer, BinauralLayer, Job, JobFilter, JobPayload, JobSpec, JobStatus, LayerConfig,
    LayerGains, OutputFormat, OutputOptions, Quality, ResultMetadata, SolfeggioLayer,
    StorageLocation, VoiceRef,
};
pub use store::{JobStore, JobSubscription, StoreResult};

#[cfg(test)]
pub(crate) use model::fixtures;
