//! Client-side data synchronization for social protection program APIs.
//!
//! - [`batch`] fetches every beneficiary of a project through serial,
//!   cursor-paged GraphQL requests.
//! - [`query`] serves data stale-while-revalidate from the two-tier
//!   [`cache`].

pub mod batch;
pub mod cache;
pub mod config;
pub mod graphql;
pub mod logging;
pub mod query;

pub use batch::{BatchError, BatchFetcher, BatchHandle, BatchPage, BatchRequest, BatchSummary};
pub use query::{CachedQuery, FetchError, QueryPhase};
