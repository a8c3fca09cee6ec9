pub mod aggregator;
pub mod channel;
pub mod config;
pub mod feed;
pub mod fetcher;
pub mod http;
pub mod reading;
pub mod retry;
pub mod source;
pub mod telemetry;
pub mod uploader;

#[cfg(test)]
pub mod test_support;
