pub mod error;
#[cfg(test)]
pub mod fake;
pub mod http;
pub mod source;

pub use error::ApiError;
#[cfg(test)]
pub use fake::FakeEventSource;
pub use http::HttpEventSource;
#[allow(unused_imports)]
pub use source::{ApiRecord, EventSource, Page};
