//! Serde-deserializable types matching GraphQL responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::{de::DeserializeOwned, Deserialize};

use super::types::{
  Beneficiary, GroupBeneficiary, GroupRef, IndividualBeneficiary, IndividualRef, Page, PageInfo,
};

/// Convert a JSON value into a typed struct.
pub fn reserialize<T: DeserializeOwned>(value: serde_json::Value) -> serde_json::Result<T> {
  serde_json::from_value(value)
}

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiResponse {
  pub data: Option<serde_json::Value>,
  #[serde(default)]
  pub errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
  pub message: String,
}

// ============================================================================
// Relay connection
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPageInfo {
  #[serde(default)]
  pub has_next_page: bool,
  pub end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiEdge<N> {
  pub node: N,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConnection<N> {
  pub total_count: Option<u64>,
  pub page_info: ApiPageInfo,
  #[serde(default = "Vec::new")]
  pub edges: Vec<ApiEdge<N>>,
}

impl<N> ApiConnection<N> {
  pub fn into_page<T>(self, convert: impl Fn(N) -> T) -> Page<T> {
    Page {
      nodes: self.edges.into_iter().map(|edge| convert(edge.node)).collect(),
      page_info: PageInfo {
        has_next_page: self.page_info.has_next_page,
        end_cursor: self.page_info.end_cursor,
        total_count: self.total_count,
      },
    }
  }
}

// ============================================================================
// Beneficiary nodes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIndividual {
  pub id: String,
  #[serde(default)]
  pub first_name: String,
  #[serde(default)]
  pub last_name: String,
  pub dob: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiIndividualBeneficiary {
  pub id: String,
  #[serde(default)]
  pub status: String,
  pub date_valid_from: Option<String>,
  pub date_valid_to: Option<String>,
  pub individual: ApiIndividual,
}

impl From<ApiIndividualBeneficiary> for Beneficiary {
  fn from(api: ApiIndividualBeneficiary) -> Self {
    Beneficiary::Individual(IndividualBeneficiary {
      id: api.id,
      status: api.status,
      date_valid_from: api.date_valid_from,
      date_valid_to: api.date_valid_to,
      individual: IndividualRef {
        id: api.individual.id,
        first_name: api.individual.first_name,
        last_name: api.individual.last_name,
        dob: api.individual.dob,
      },
    })
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiGroup {
  pub id: String,
  #[serde(default)]
  pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroupBeneficiary {
  pub id: String,
  #[serde(default)]
  pub status: String,
  pub date_valid_from: Option<String>,
  pub date_valid_to: Option<String>,
  pub group: ApiGroup,
}

impl From<ApiGroupBeneficiary> for Beneficiary {
  fn from(api: ApiGroupBeneficiary) -> Self {
    Beneficiary::Group(GroupBeneficiary {
      id: api.id,
      status: api.status,
      date_valid_from: api.date_valid_from,
      date_valid_to: api.date_valid_to,
      group: GroupRef {
        id: api.group.id,
        code: api.group.code,
      },
    })
  }
}
