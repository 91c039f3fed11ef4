use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Client};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::batch::PageFetcher;
use crate::config::Config;
use crate::graphql::api_types::{
  reserialize, ApiConnection, ApiGroupBeneficiary, ApiIndividualBeneficiary, ApiResponse,
};
use crate::graphql::filter::render_arguments;
use crate::graphql::types::{Beneficiary, BeneficiaryVariant, Page, PageRequest};

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

const INDIVIDUAL_BENEFICIARY_FIELDS: &str =
  "id status dateValidFrom dateValidTo individual { id firstName lastName dob }";

const GROUP_BENEFICIARY_FIELDS: &str = "id status dateValidFrom dateValidTo group { id code }";

/// GraphQL API client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct GraphqlClient {
  http: Client,
  url: url::Url,
  token: Option<String>,
}

impl GraphqlClient {
  pub fn new(config: &Config) -> Result<Self> {
    let url = url::Url::parse(&config.graphql.url)
      .map_err(|e| eyre!("Invalid GraphQL url {}: {}", config.graphql.url, e))?;
    Self::with_endpoint(
      url,
      Config::get_api_token(),
      Duration::from_secs(config.graphql.timeout_secs),
    )
  }

  pub fn with_endpoint(url: url::Url, token: Option<String>, timeout: Duration) -> Result<Self> {
    let http = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, url, token })
  }

  /// Run a query and return its `data` object.
  pub async fn execute(&self, query: &str) -> Result<Value> {
    let mut request = self
      .http
      .post(self.url.clone())
      .header(header::ACCEPT, "application/json")
      .json(&json!({ "query": query }));
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to send GraphQL request: {}", e))?;

    let status = response.status();
    let body = response
      .text()
      .await
      .map_err(|e| eyre!("Failed to read GraphQL response: {}", e))?;
    if !status.is_success() {
      return Err(eyre!("GraphQL request failed with status {}: {}", status, truncate_body(&body)));
    }

    parse_response(&body)
  }

  /// Fetch one page of beneficiaries.
  pub async fn beneficiary_page(&self, request: &PageRequest) -> Result<Page<Beneficiary>> {
    let query = page_query(request)?;
    debug!(variant = ?request.variant, offset = request.offset, "Fetching beneficiary page");
    let data = self.execute(&query).await?;
    parse_page(request.variant, data)
  }
}

#[async_trait]
impl PageFetcher for GraphqlClient {
  async fn fetch_page(&self, request: &PageRequest) -> Result<Page<Beneficiary>> {
    self.beneficiary_page(request).await
  }
}

/// Build the query text for a page request.
pub fn page_query(request: &PageRequest) -> Result<String> {
  let fields = match request.variant {
    BeneficiaryVariant::Individual => INDIVIDUAL_BENEFICIARY_FIELDS,
    BeneficiaryVariant::Group => GROUP_BENEFICIARY_FIELDS,
  };
  let arguments = render_arguments(&request.arguments())?;

  Ok(format!(
    "{{ {}({}) {{ totalCount pageInfo {{ hasNextPage endCursor }} edges {{ node {{ {} }} }} }} }}",
    request.variant.query_field(),
    arguments,
    fields
  ))
}

/// Unwrap the GraphQL envelope, turning `errors` into an error.
pub fn parse_response(body: &str) -> Result<Value> {
  let response: ApiResponse = serde_json::from_str(body)
    .map_err(|e| eyre!("Invalid GraphQL response: {}: {}", e, truncate_body(body)))?;

  if !response.errors.is_empty() {
    let messages: Vec<&str> = response.errors.iter().map(|e| e.message.as_str()).collect();
    return Err(eyre!("GraphQL errors: {}", messages.join("; ")));
  }

  response
    .data
    .ok_or_else(|| eyre!("GraphQL response has no data"))
}

/// Decode the connection for `variant` out of a `data` object.
pub fn parse_page(variant: BeneficiaryVariant, mut data: Value) -> Result<Page<Beneficiary>> {
  let field = variant.query_field();
  let connection = data
    .get_mut(field)
    .map(Value::take)
    .filter(|v| !v.is_null())
    .ok_or_else(|| eyre!("GraphQL response is missing field {}", field))?;

  let page = match variant {
    BeneficiaryVariant::Individual => {
      let connection: ApiConnection<ApiIndividualBeneficiary> = reserialize(connection)
        .map_err(|e| eyre!("Failed to parse {} page: {}", field, e))?;
      connection.into_page(Beneficiary::from)
    }
    BeneficiaryVariant::Group => {
      let connection: ApiConnection<ApiGroupBeneficiary> = reserialize(connection)
        .map_err(|e| eyre!("Failed to parse {} page: {}", field, e))?;
      connection.into_page(Beneficiary::from)
    }
  };

  Ok(page)
}

/// Truncate a response body to avoid logging excessive data
fn truncate_body(body: &str) -> String {
  if body.len() <= MAX_ERROR_BODY_LENGTH {
    return body.to_string();
  }
  let mut end = MAX_ERROR_BODY_LENGTH;
  while !body.is_char_boundary(end) {
    end -= 1;
  }
  format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
}
