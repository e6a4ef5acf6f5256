pub mod fixture;
pub mod http_json;

pub use fixture::FixtureProvider;
pub use http_json::HttpJsonProvider;
