pub mod indexer_api;
pub mod rest_client;

pub use indexer_api::{IndexerApi, IndexerClient};
pub use rest_client::{parse_header, RestClient, RestError};
