pub mod error;
#[cfg(test)]
pub mod fake;
pub mod models;
pub mod sqlite;
#[allow(clippy::module_inception)]
pub mod store;

pub use error::StoreError;
#[cfg(test)]
pub use fake::FakeStore;
#[allow(unused_imports)]
pub use models::{
    BasalDelivery, CgmReading, Event, EventType, ExtractOutcome, ExtractTarget, ExtractionSkip,
    NewBasalDelivery, NewCgmReading, NewEvent, NewRawEvent, RawBatchOutcome, RawEvent,
    StoreStats, Watermark,
};
pub use sqlite::SqliteStore;
pub use store::PipelineStore;
