//! Fetch every beneficiary linked to a project, one page at a time.
//!
//! A batch issues serial page requests with a stable ordering. After each page
//! the end cursor is decoded and the next request starts at
//! `decoded_offset + 1`, until the server reports no further pages. Each page
//! is emitted as a [`BatchPage`] as soon as it arrives; the first is marked as
//! the initial page and the rest as continuations, so consumers can replace on
//! the first and append afterwards (see [`BeneficiaryAccumulator`]).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::DEFAULT_PAGE_SIZE;
use crate::graphql::cursor;
use crate::graphql::filter::Filter;
use crate::graphql::types::{Beneficiary, BeneficiaryVariant, Page, PageInfo, PageRequest};

/// Capability to fetch one page of beneficiaries.
#[async_trait]
pub trait PageFetcher: Send + Sync {
  async fn fetch_page(&self, request: &PageRequest) -> color_eyre::Result<Page<Beneficiary>>;
}

/// Why a batch stopped before the last page.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
  #[error("page at offset {offset} has more pages but end cursor {cursor:?} carries no offset")]
  MalformedCursor { offset: u64, cursor: Option<String> },
  #[error("end cursor of page at offset {offset} points back to offset {next}")]
  OffsetNotAdvancing { offset: u64, next: u64 },
  #[error("failed to fetch page at offset {offset}: {message}")]
  Fetch { offset: u64, message: String },
  #[error("batch cancelled")]
  Cancelled,
  #[error("batch task failed: {0}")]
  Task(String),
}

/// Request to fetch all beneficiaries of one project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
  pub project_id: String,
  pub variant: BeneficiaryVariant,
  /// Where to start. Absent means the first record.
  pub offset: Option<u64>,
  /// Marks the first emitted page as a continuation of an earlier batch.
  pub continuation: bool,
}

impl BatchRequest {
  pub fn new(project_id: impl Into<String>, variant: BeneficiaryVariant) -> Self {
    Self {
      project_id: project_id.into(),
      variant,
      offset: None,
      continuation: false,
    }
  }

  /// Resume a batch at `offset`.
  pub fn resume_at(mut self, offset: u64) -> Self {
    self.offset = Some(offset);
    self.continuation = true;
    self
  }

  fn page_request(&self, offset: u64, page_size: u32) -> PageRequest {
    PageRequest {
      variant: self.variant,
      filters: vec![
        Filter::eq("project_Id", self.project_id.as_str()),
        Filter::eq("isDeleted", false),
      ],
      order_by: self
        .variant
        .order_by()
        .iter()
        .map(|field| field.to_string())
        .collect(),
      first: page_size,
      offset,
    }
  }
}

/// One page delivered by a running batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchPage {
  pub project_id: String,
  pub variant: BeneficiaryVariant,
  pub offset: u64,
  pub continuation: bool,
  pub beneficiaries: Vec<Beneficiary>,
  pub page_info: PageInfo,
}

/// Totals for a finished batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
  pub project_id: String,
  pub variant: BeneficiaryVariant,
  pub pages: usize,
  pub records: usize,
  pub total_count: Option<u64>,
}

/// Offset of the page after the one that started at `offset`.
pub fn next_offset(offset: u64, end_cursor: Option<&str>) -> Result<u64, BatchError> {
  let next = end_cursor
    .and_then(cursor::decode_offset)
    .and_then(|last| last.checked_add(1))
    .ok_or_else(|| BatchError::MalformedCursor {
      offset,
      cursor: end_cursor.map(String::from),
    })?;

  if next <= offset {
    return Err(BatchError::OffsetNotAdvancing { offset, next });
  }
  Ok(next)
}

/// Runs batches against a [`PageFetcher`].
pub struct BatchFetcher<F: PageFetcher> {
  fetcher: Arc<F>,
  page_size: u32,
}

impl<F: PageFetcher> Clone for BatchFetcher<F> {
  fn clone(&self) -> Self {
    Self {
      fetcher: Arc::clone(&self.fetcher),
      page_size: self.page_size,
    }
  }
}

impl<F: PageFetcher + 'static> BatchFetcher<F> {
  pub fn new(fetcher: F) -> Self {
    Self {
      fetcher: Arc::new(fetcher),
      page_size: DEFAULT_PAGE_SIZE,
    }
  }

  pub fn with_page_size(mut self, page_size: u32) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn fetcher(&self) -> &F {
    &self.fetcher
  }

  /// Spawn a batch and return a handle to its pages.
  pub fn start(&self, request: BatchRequest) -> BatchHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let this = self.clone();
    let token = cancel.clone();
    let task = tokio::spawn(async move { this.run(request, tx, &token).await });

    BatchHandle {
      pages: rx,
      cancel,
      task,
    }
  }

  /// Fetch pages until the server reports the last one.
  ///
  /// Pages are sent to `pages` as they arrive; a dropped receiver does not
  /// stop the batch. Cancellation is checked while each request is pending.
  pub async fn run(
    &self,
    request: BatchRequest,
    pages: mpsc::UnboundedSender<BatchPage>,
    cancel: &CancellationToken,
  ) -> Result<BatchSummary, BatchError> {
    let mut offset = request.offset.unwrap_or(0);
    let mut continuation = request.continuation;
    let mut summary = BatchSummary {
      project_id: request.project_id.clone(),
      variant: request.variant,
      pages: 0,
      records: 0,
      total_count: None,
    };

    loop {
      let page_request = request.page_request(offset, self.page_size);
      debug!(
        project = %request.project_id,
        variant = ?request.variant,
        offset,
        continuation,
        "Fetching page"
      );

      let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          info!(project = %request.project_id, offset, "Batch cancelled");
          return Err(BatchError::Cancelled);
        }
        result = self.fetcher.fetch_page(&page_request) => result,
      };
      let page = result.map_err(|e| {
        error!(project = %request.project_id, offset, error = %e, "Batch page failed");
        BatchError::Fetch {
          offset,
          message: format!("{:#}", e),
        }
      })?;

      summary.pages += 1;
      summary.records += page.nodes.len();
      if page.page_info.total_count.is_some() {
        summary.total_count = page.page_info.total_count;
      }

      let has_next_page = page.page_info.has_next_page;
      let end_cursor = page.page_info.end_cursor.clone();
      // Ignore send errors - receiver may have been dropped
      let _ = pages.send(BatchPage {
        project_id: request.project_id.clone(),
        variant: request.variant,
        offset,
        continuation,
        beneficiaries: page.nodes,
        page_info: page.page_info,
      });

      if !has_next_page {
        info!(
          project = %request.project_id,
          pages = summary.pages,
          records = summary.records,
          "Batch complete"
        );
        return Ok(summary);
      }

      offset = next_offset(offset, end_cursor.as_deref()).map_err(|e| {
        error!(project = %request.project_id, error = %e, "Batch aborted");
        e
      })?;
      continuation = true;
    }
  }
}

/// A running batch.
pub struct BatchHandle {
  pages: mpsc::UnboundedReceiver<BatchPage>,
  cancel: CancellationToken,
  task: JoinHandle<Result<BatchSummary, BatchError>>,
}

impl BatchHandle {
  /// Next delivered page, or `None` once the batch has stopped and every
  /// page has been received.
  pub async fn next_page(&mut self) -> Option<BatchPage> {
    self.pages.recv().await
  }

  /// Stop the batch at its next suspension point.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// Wait for the batch to stop.
  pub async fn finish(self) -> Result<BatchSummary, BatchError> {
    match self.task.await {
      Ok(result) => result,
      Err(e) if e.is_cancelled() => Err(BatchError::Cancelled),
      Err(e) => Err(BatchError::Task(e.to_string())),
    }
  }
}

/// Collects batch pages the way a list view would.
///
/// An initial page replaces whatever was collected before; a continuation
/// appends.
#[derive(Debug, Clone, Default)]
pub struct BeneficiaryAccumulator {
  records: Vec<Beneficiary>,
  total_count: Option<u64>,
  pages: usize,
  complete: bool,
}

impl BeneficiaryAccumulator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn apply(&mut self, page: BatchPage) {
    if !page.continuation {
      self.records.clear();
      self.pages = 0;
    }
    self.records.extend(page.beneficiaries);
    if page.page_info.total_count.is_some() {
      self.total_count = page.page_info.total_count;
    }
    self.pages += 1;
    self.complete = !page.page_info.has_next_page;
  }

  pub fn records(&self) -> &[Beneficiary] {
    &self.records
  }

  pub fn total_count(&self) -> Option<u64> {
    self.total_count
  }

  pub fn pages(&self) -> usize {
    self.pages
  }

  /// Whether the last applied page was the final one.
  pub fn is_complete(&self) -> bool {
    self.complete
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graphql::cursor::{encode, ARRAY_CONNECTION_PREFIX};
  use crate::graphql::filter::FilterValue;
  use crate::graphql::types::{IndividualBeneficiary, IndividualRef};
  use color_eyre::eyre::eyre;
  use std::collections::VecDeque;
  use std::sync::Mutex;
  use std::time::Duration;

  fn beneficiary(n: u64) -> Beneficiary {
    Beneficiary::Individual(IndividualBeneficiary {
      id: format!("b{}", n),
      status: "ACTIVE".to_string(),
      date_valid_from: None,
      date_valid_to: None,
      individual: IndividualRef {
        id: format!("i{}", n),
        first_name: "First".to_string(),
        last_name: format!("Last{:04}", n),
        dob: None,
      },
    })
  }

  /// Serves `total` records the way the server pages an array connection.
  struct DatasetFetcher {
    total: u64,
    delay: Option<Duration>,
    fail_at_offset: Option<u64>,
    requests: Mutex<Vec<PageRequest>>,
  }

  impl DatasetFetcher {
    fn new(total: u64) -> Self {
      Self {
        total,
        delay: None,
        fail_at_offset: None,
        requests: Mutex::new(Vec::new()),
      }
    }

    fn offsets(&self) -> Vec<u64> {
      self.requests.lock().unwrap().iter().map(|r| r.offset).collect()
    }
  }

  #[async_trait]
  impl PageFetcher for DatasetFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> color_eyre::Result<Page<Beneficiary>> {
      self.requests.lock().unwrap().push(request.clone());
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      if self.fail_at_offset == Some(request.offset) {
        return Err(eyre!("connection reset"));
      }

      let start = request.offset.min(self.total);
      let end = (request.offset + u64::from(request.first)).min(self.total);
      let nodes: Vec<Beneficiary> = (start..end).map(beneficiary).collect();
      let end_cursor = (end > start).then(|| encode(ARRAY_CONNECTION_PREFIX, end - 1));

      Ok(Page {
        nodes,
        page_info: PageInfo {
          has_next_page: end < self.total,
          end_cursor,
          total_count: Some(self.total),
        },
      })
    }
  }

  /// Returns canned pages in order.
  struct ScriptedFetcher {
    pages: Mutex<VecDeque<Page<Beneficiary>>>,
    calls: Mutex<usize>,
  }

  impl ScriptedFetcher {
    fn new(pages: Vec<Page<Beneficiary>>) -> Self {
      Self {
        pages: Mutex::new(pages.into()),
        calls: Mutex::new(0),
      }
    }

    fn calls(&self) -> usize {
      *self.calls.lock().unwrap()
    }
  }

  #[async_trait]
  impl PageFetcher for ScriptedFetcher {
    async fn fetch_page(&self, _request: &PageRequest) -> color_eyre::Result<Page<Beneficiary>> {
      *self.calls.lock().unwrap() += 1;
      self
        .pages
        .lock()
        .unwrap()
        .pop_front()
        .ok_or_else(|| eyre!("no more scripted pages"))
    }
  }

  fn scripted_page(has_next_page: bool, end_cursor: Option<String>) -> Page<Beneficiary> {
    Page {
      nodes: vec![beneficiary(0)],
      page_info: PageInfo {
        has_next_page,
        end_cursor,
        total_count: None,
      },
    }
  }

  async fn run_to_end<F: PageFetcher + 'static>(
    batch: &BatchFetcher<F>,
    request: BatchRequest,
  ) -> (Result<BatchSummary, BatchError>, Vec<BatchPage>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = batch.run(request, tx, &CancellationToken::new()).await;
    let mut pages = Vec::new();
    while let Ok(page) = rx.try_recv() {
      pages.push(page);
    }
    (result, pages)
  }

  #[tokio::test]
  async fn test_250_records_in_three_pages() {
    let batch = BatchFetcher::new(DatasetFetcher::new(250));
    let mut handle = batch.start(BatchRequest::new("P", BeneficiaryVariant::Individual));

    let mut accumulator = BeneficiaryAccumulator::new();
    let mut sizes = Vec::new();
    let mut continuations = Vec::new();
    while let Some(page) = handle.next_page().await {
      sizes.push(page.beneficiaries.len());
      continuations.push(page.continuation);
      accumulator.apply(page);
    }
    let summary = handle.finish().await.unwrap();

    assert_eq!(batch.fetcher().offsets(), vec![0, 100, 200]);
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(continuations, vec![false, true, true]);
    assert_eq!(accumulator.records().len(), 250);
    assert_eq!(accumulator.total_count(), Some(250));
    assert!(accumulator.is_complete());
    assert_eq!(summary.pages, 3);
    assert_eq!(summary.records, 250);
  }

  #[tokio::test]
  async fn test_continuation_count_matches_page_math() {
    for total in [1u64, 99, 100, 101, 199, 200, 1_000, 1_001] {
      let batch = BatchFetcher::new(DatasetFetcher::new(total));
      let (result, pages) =
        run_to_end(&batch, BatchRequest::new("P", BeneficiaryVariant::Individual)).await;

      let summary = result.unwrap();
      let continuations = pages.iter().filter(|p| p.continuation).count() as u64;
      assert_eq!(continuations, total.div_ceil(100) - 1, "total = {}", total);
      assert_eq!(summary.records as u64, total);
      assert!(!pages.last().unwrap().page_info.has_next_page);
    }
  }

  #[tokio::test]
  async fn test_empty_project_issues_one_request() {
    let batch = BatchFetcher::new(DatasetFetcher::new(0));
    let (result, pages) =
      run_to_end(&batch, BatchRequest::new("P", BeneficiaryVariant::Group)).await;

    assert_eq!(result.unwrap().records, 0);
    assert_eq!(pages.len(), 1);
    assert_eq!(batch.fetcher().offsets(), vec![0]);
  }

  #[tokio::test]
  async fn test_offsets_follow_decoded_cursor() {
    let batch = BatchFetcher::new(DatasetFetcher::new(95)).with_page_size(30);
    let (result, pages) =
      run_to_end(&batch, BatchRequest::new("P", BeneficiaryVariant::Individual)).await;
    result.unwrap();

    for pair in pages.windows(2) {
      let end_cursor = pair[0].page_info.end_cursor.as_deref().unwrap();
      let decoded = cursor::decode_offset(end_cursor).unwrap();
      assert_eq!(pair[1].offset, decoded + 1);
      assert!(pair[1].offset > pair[0].offset);
    }
    assert_eq!(batch.fetcher().offsets(), vec![0, 30, 60, 90]);
  }

  #[tokio::test]
  async fn test_requests_carry_project_filters_and_ordering() {
    let batch = BatchFetcher::new(DatasetFetcher::new(10));
    run_to_end(&batch, BatchRequest::new("proj-1", BeneficiaryVariant::Individual))
      .await
      .0
      .unwrap();
    run_to_end(&batch, BatchRequest::new("proj-1", BeneficiaryVariant::Group))
      .await
      .0
      .unwrap();

    let requests = batch.fetcher().requests.lock().unwrap().clone();
    let individual = &requests[0];
    assert_eq!(
      individual.filters,
      vec![
        Filter::eq("project_Id", "proj-1"),
        Filter::eq("isDeleted", false)
      ]
    );
    assert_eq!(individual.first, DEFAULT_PAGE_SIZE);
    assert_eq!(individual.order_by, vec!["individual__last_name", "individual__first_name"]);
    assert!(individual
      .arguments()
      .contains(&Filter::eq("offset", FilterValue::Int(0))));

    assert_eq!(requests[1].variant, BeneficiaryVariant::Group);
    assert_eq!(requests[1].order_by, vec!["group__code"]);
  }

  #[tokio::test]
  async fn test_malformed_cursor_aborts() {
    let batch = BatchFetcher::new(ScriptedFetcher::new(vec![
      scripted_page(true, Some("definitely-not-a-cursor".to_string())),
      scripted_page(false, None),
    ]));
    let (result, pages) =
      run_to_end(&batch, BatchRequest::new("P", BeneficiaryVariant::Individual)).await;

    assert_eq!(
      result.unwrap_err(),
      BatchError::MalformedCursor {
        offset: 0,
        cursor: Some("definitely-not-a-cursor".to_string())
      }
    );
    assert_eq!(pages.len(), 1);
    assert_eq!(batch.fetcher().calls(), 1);
  }

  #[tokio::test]
  async fn test_missing_cursor_with_more_pages_aborts() {
    let batch = BatchFetcher::new(ScriptedFetcher::new(vec![scripted_page(true, None)]));
    let (result, _) =
      run_to_end(&batch, BatchRequest::new("P", BeneficiaryVariant::Individual)).await;

    assert!(matches!(
      result,
      Err(BatchError::MalformedCursor { cursor: None, .. })
    ));
  }

  #[tokio::test]
  async fn test_cursor_that_does_not_advance_aborts() {
    let cursor = encode(ARRAY_CONNECTION_PREFIX, 99);
    let batch = BatchFetcher::new(ScriptedFetcher::new(vec![
      scripted_page(true, Some(cursor.clone())),
      scripted_page(true, Some(cursor)),
      scripted_page(false, None),
    ]));
    let (result, pages) =
      run_to_end(&batch, BatchRequest::new("P", BeneficiaryVariant::Individual)).await;

    assert_eq!(
      result.unwrap_err(),
      BatchError::OffsetNotAdvancing {
        offset: 100,
        next: 100
      }
    );
    assert_eq!(pages.len(), 2);
    assert_eq!(batch.fetcher().calls(), 2);
  }

  #[tokio::test]
  async fn test_failed_page_stops_batch() {
    let mut fetcher = DatasetFetcher::new(250);
    fetcher.fail_at_offset = Some(100);
    let batch = BatchFetcher::new(fetcher);
    let (result, pages) =
      run_to_end(&batch, BatchRequest::new("P", BeneficiaryVariant::Individual)).await;

    match result {
      Err(BatchError::Fetch { offset, message }) => {
        assert_eq!(offset, 100);
        assert!(message.contains("connection reset"));
      }
      other => panic!("expected fetch error, got {:?}", other),
    }
    assert_eq!(pages.len(), 1);
    assert_eq!(batch.fetcher().offsets(), vec![0, 100]);
  }

  #[tokio::test]
  async fn test_resume_marks_first_page_as_continuation() {
    let batch = BatchFetcher::new(DatasetFetcher::new(250));
    let (result, pages) = run_to_end(
      &batch,
      BatchRequest::new("P", BeneficiaryVariant::Individual).resume_at(100),
    )
    .await;

    assert_eq!(result.unwrap().records, 150);
    assert!(pages.iter().all(|p| p.continuation));
    assert_eq!(batch.fetcher().offsets(), vec![100, 200]);
  }

  #[tokio::test]
  async fn test_cancel_stops_running_batch() {
    let mut fetcher = DatasetFetcher::new(10_000);
    fetcher.delay = Some(Duration::from_millis(30));
    let batch = BatchFetcher::new(fetcher);
    let mut handle = batch.start(BatchRequest::new("P", BeneficiaryVariant::Individual));

    let first = handle.next_page().await.unwrap();
    assert_eq!(first.offset, 0);
    handle.cancel();

    assert_eq!(handle.finish().await.unwrap_err(), BatchError::Cancelled);
    assert!(batch.fetcher().offsets().len() <= 2);
  }

  #[test]
  fn test_next_offset() {
    let last_record = encode(ARRAY_CONNECTION_PREFIX, 99);
    assert_eq!(next_offset(0, Some(last_record.as_str())), Ok(100));

    let overflowing = encode(ARRAY_CONNECTION_PREFIX, u64::MAX);
    assert_eq!(
      next_offset(0, Some(overflowing.as_str())),
      Err(BatchError::MalformedCursor {
        offset: 0,
        cursor: Some(overflowing.clone())
      })
    );
  }

  #[test]
  fn test_accumulator_replaces_on_initial_page() {
    let page = |continuation: bool, ids: Vec<u64>| BatchPage {
      project_id: "P".to_string(),
      variant: BeneficiaryVariant::Individual,
      offset: 0,
      continuation,
      beneficiaries: ids.into_iter().map(beneficiary).collect(),
      page_info: PageInfo {
        has_next_page: continuation,
        end_cursor: None,
        total_count: Some(3),
      },
    };

    let mut accumulator = BeneficiaryAccumulator::new();
    accumulator.apply(page(false, vec![1, 2]));
    accumulator.apply(page(true, vec![3]));
    assert_eq!(accumulator.records().len(), 3);
    assert_eq!(accumulator.pages(), 2);

    // A new batch starts over
    accumulator.apply(page(false, vec![9]));
    assert_eq!(accumulator.records(), &[beneficiary(9)]);
    assert_eq!(accumulator.pages(), 1);
    assert!(accumulator.is_complete());
  }
}
