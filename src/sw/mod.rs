mod network;
mod notify;
mod partitions;
mod request;
mod router;
mod strategy;
#[cfg(test)]
mod testing;
mod worker;

pub use network::HttpNetwork;
pub use notify::LogHost;
pub use partitions::ResponseCache;
pub use request::{Destination, Request};
pub use router::FetchOutcome;
pub use worker::ServiceWorker;
