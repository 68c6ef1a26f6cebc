mod cache;
pub mod client;
pub mod error;
pub mod params;
pub mod retry;
pub mod transport;
pub mod types;

pub use client::{ApiResult, YouTrackClient};
pub use error::ClassifiedFailure;
