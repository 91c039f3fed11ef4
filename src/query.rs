//! Stale-while-revalidate query over a [`CacheLayer`].
//!
//! A `CachedQuery<T, S>` owns one producer and one cache key. On mount it
//! serves whatever valid entry the cache holds, revalidating silently when the
//! entry is stale, and fetches normally on a miss. Results arrive over a
//! channel and are applied by `poll()` (from an event loop tick) or
//! `settle()` (awaited).
//!
//! # Example
//!
//! ```ignore
//! let client = graphql.clone();
//! let mut query = CachedQuery::new("dash-A", cache.clone(), move |token| {
//!     let client = client.clone();
//!     async move { client.raw_query(DASHBOARD_QUERY, &token).await.map_err(FetchError::from) }
//! });
//!
//! query.mount();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match query.phase() {
//!     QueryPhase::Loading => render_spinner(),
//!     QueryPhase::DisplayFresh | QueryPhase::DisplayStale => render(query.data()),
//!     QueryPhase::Error => render_error(query.error()),
//!     QueryPhase::Initial => {}
//! }
//! ```

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, CachePort};

/// Why a producer did not return data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  /// The request was aborted or superseded. Never shown to the user.
  #[error("request cancelled")]
  Cancelled,
  #[error("{0}")]
  Failed(String),
}

impl FetchError {
  pub fn failed(message: impl fmt::Display) -> Self {
    FetchError::Failed(message.to_string())
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(self, FetchError::Cancelled)
  }
}

impl From<color_eyre::Report> for FetchError {
  fn from(report: color_eyre::Report) -> Self {
    FetchError::Failed(format!("{:#}", report))
  }
}

/// Where a query sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPhase {
  /// Not mounted yet
  Initial,
  /// A non-silent fetch is running
  Loading,
  /// Showing data that is within the freshness window
  DisplayFresh,
  /// Showing stale data, possibly while revalidating in the background
  DisplayStale,
  /// The last fetch failed; previous data (if any) is still available
  Error,
}

/// A factory that starts one fetch per call
type ProducerFn<T> =
  Box<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync>;

struct InFlight<T> {
  token: CancellationToken,
  receiver: mpsc::UnboundedReceiver<Result<T, FetchError>>,
}

/// A cached, single-flight async query.
///
/// At most one fetch is in flight per instance; starting another cancels the
/// previous one and its result is never applied.
pub struct CachedQuery<T, S: CachePort> {
  key: String,
  cache: CacheLayer<S>,
  producer: ProducerFn<T>,
  data: Option<T>,
  loading: bool,
  error: Option<String>,
  is_stale: bool,
  mounted: bool,
  in_flight: Option<InFlight<T>>,
}

impl<T, S> CachedQuery<T, S>
where
  T: Clone + Serialize + DeserializeOwned + Send + 'static,
  S: CachePort + 'static,
{
  /// Create a query for `key`. Nothing is fetched until `mount()`.
  ///
  /// The producer receives a token that is cancelled when the fetch is
  /// superseded or the query is dropped.
  pub fn new<F, Fut>(key: impl Into<String>, cache: CacheLayer<S>, producer: F) -> Self
  where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    Self {
      key: key.into(),
      cache,
      producer: Box::new(move |token| -> BoxFuture<'static, Result<T, FetchError>> {
        Box::pin(producer(token))
      }),
      data: None,
      loading: false,
      error: None,
      is_stale: false,
      mounted: false,
      in_flight: None,
    }
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn data(&self) -> Option<&T> {
    self.data.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.loading
  }

  pub fn error(&self) -> Option<&str> {
    self.error.as_deref()
  }

  pub fn is_stale(&self) -> bool {
    self.is_stale
  }

  /// Whether any fetch, silent or not, is outstanding.
  pub fn is_fetching(&self) -> bool {
    self.in_flight.is_some()
  }

  pub fn phase(&self) -> QueryPhase {
    if self.loading {
      QueryPhase::Loading
    } else if self.error.is_some() {
      QueryPhase::Error
    } else if self.data.is_some() {
      if self.is_stale {
        QueryPhase::DisplayStale
      } else {
        QueryPhase::DisplayFresh
      }
    } else {
      QueryPhase::Initial
    }
  }

  /// Serve from cache if possible, otherwise fetch.
  pub fn mount(&mut self) {
    self.mounted = true;
    match self.cache.get::<T>(&self.key) {
      Some(hit) => {
        debug!(key = %self.key, stale = hit.is_stale, "Serving cached data");
        self.data = Some(hit.data);
        self.loading = false;
        self.is_stale = hit.is_stale;
        if hit.is_stale {
          self.fetch(true);
        }
      }
      None => self.fetch(false),
    }
  }

  /// Switch to a different key, cancelling any in-flight fetch, and mount again.
  pub fn set_key(&mut self, key: impl Into<String>) {
    self.cancel();
    self.key = key.into();
    self.data = None;
    self.error = None;
    self.is_stale = false;
    self.mount();
  }

  /// Start a fetch, cancelling the previous one.
  ///
  /// A silent fetch leaves the loading flag alone so stale data can stay on
  /// screen while it runs.
  pub fn fetch(&mut self, silent: bool) {
    self.cancel_in_flight();

    let (tx, rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    self.in_flight = Some(InFlight {
      token: token.clone(),
      receiver: rx,
    });
    if !silent {
      self.loading = true;
    }

    let future = (self.producer)(token.clone());
    tokio::spawn(async move {
      let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(FetchError::Cancelled),
        result = future => result,
      };
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }

  /// Drop staleness and force a visible fetch, even on a fresh cache hit.
  pub fn refresh(&mut self) {
    self.is_stale = false;
    self.fetch(false);
  }

  /// Warm the cache for another key in the background.
  ///
  /// Skipped when the persisted tier already holds `key`. Failures are only
  /// logged. Returns the background task when one was started.
  pub fn prefetch<F, Fut>(&self, key: &str, producer: F) -> Option<JoinHandle<()>>
  where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    if self.cache.contains(key) {
      return None;
    }

    let future = producer(CancellationToken::new());
    let cache = self.cache.clone();
    let key = key.to_string();
    Some(tokio::spawn(async move {
      match future.await {
        Ok(data) => cache.set(&key, &data),
        Err(e) => warn!(key = %key, error = %e, "Prefetch failed"),
      }
    }))
  }

  /// Cancel the in-flight fetch, if any.
  pub fn cancel(&mut self) {
    if self.cancel_in_flight() {
      self.loading = false;
    }
  }

  /// Apply a finished fetch without blocking.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.in_flight {
      Some(in_flight) => &mut in_flight.receiver,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.in_flight = None;
        self.apply(result)
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.in_flight = None;
        self.apply(Err(FetchError::failed("Fetch task ended without a result")))
      }
    }
  }

  /// Wait for the in-flight fetch and apply it.
  ///
  /// Returns `false` immediately when nothing is in flight.
  pub async fn settle(&mut self) -> bool {
    let received = match &mut self.in_flight {
      Some(in_flight) => in_flight.receiver.recv().await,
      None => return false,
    };
    self.in_flight = None;
    match received {
      Some(result) => self.apply(result),
      None => self.apply(Err(FetchError::failed("Fetch task ended without a result"))),
    }
  }

  /// Only the accepted result of the current fetch reaches the cache, so
  /// a superseded fetch never writes it.
  fn apply(&mut self, result: Result<T, FetchError>) -> bool {
    match result {
      Ok(data) => {
        self.cache.set(&self.key, &data);
        self.data = Some(data);
        self.error = None;
        self.is_stale = false;
        self.loading = false;
        true
      }
      Err(FetchError::Cancelled) => {
        debug!(key = %self.key, "Fetch cancelled");
        let was_loading = self.loading;
        self.loading = false;
        was_loading
      }
      Err(FetchError::Failed(message)) => {
        warn!(key = %self.key, error = %message, "Fetch failed");
        self.error = Some(message);
        self.loading = false;
        true
      }
    }
  }
}

impl<T, S: CachePort> CachedQuery<T, S> {
  fn cancel_in_flight(&mut self) -> bool {
    match self.in_flight.take() {
      Some(in_flight) => {
        in_flight.token.cancel();
        true
      }
      None => false,
    }
  }
}

impl<T, S: CachePort> Drop for CachedQuery<T, S> {
  fn drop(&mut self) {
    self.cancel_in_flight();
  }
}

impl<T: fmt::Debug, S: CachePort> fmt::Debug for CachedQuery<T, S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CachedQuery")
      .field("key", &self.key)
      .field("data", &self.data)
      .field("loading", &self.loading)
      .field("error", &self.error)
      .field("is_stale", &self.is_stale)
      .field("mounted", &self.mounted)
      .finish_non_exhaustive()
  }
}
