pub mod executor;
pub mod proxy_source;
