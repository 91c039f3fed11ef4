//! GraphQL transport for the social protection API.
//!
//! Queries are assembled from structured [`filter::Filter`] arguments and
//! posted with reqwest. Responses are decoded through the `api_types`
//! wire structs into domain [`types`].

pub mod api_types;
pub mod cache;
pub mod client;
pub mod cursor;
pub mod filter;
pub mod types;

pub use cache::query_cache_key;
pub use client::GraphqlClient;
pub use filter::{Filter, FilterValue, Op};
pub use types::{Beneficiary, BeneficiaryVariant, Page, PageInfo, PageRequest};
