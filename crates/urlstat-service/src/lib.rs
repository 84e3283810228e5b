//! The urlstat service: configuration, the document fetcher, and the pipeline that runs it for
//! many URLs.

pub mod config;
pub mod fetch;
pub mod pipeline;

pub use urlstat_cache as cache;
pub use urlstat_dispatch as dispatch;
