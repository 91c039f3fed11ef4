use serde::{Deserialize, Serialize};

use super::filter::{Filter, FilterValue};

/// Which connection a beneficiary page is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeneficiaryVariant {
  /// Individuals enrolled in a project
  Individual,
  /// Groups (households) enrolled in a project
  Group,
}

impl BeneficiaryVariant {
  /// Root query field for this variant.
  pub fn query_field(self) -> &'static str {
    match self {
      BeneficiaryVariant::Individual => "beneficiary",
      BeneficiaryVariant::Group => "groupBeneficiary",
    }
  }

  /// Ordering that stays stable across pages, so offsets neither skip nor
  /// repeat records.
  pub fn order_by(self) -> &'static [&'static str] {
    match self {
      BeneficiaryVariant::Individual => &["individual__last_name", "individual__first_name"],
      BeneficiaryVariant::Group => &["group__code"],
    }
  }
}

/// Relay page metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
  pub has_next_page: bool,
  pub end_cursor: Option<String>,
  pub total_count: Option<u64>,
}

/// One page of a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
  pub nodes: Vec<T>,
  pub page_info: PageInfo,
}

/// Individual linked to a beneficiary record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualRef {
  pub id: String,
  pub first_name: String,
  pub last_name: String,
  pub dob: Option<String>,
}

/// Group linked to a group beneficiary record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
  pub id: String,
  pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndividualBeneficiary {
  pub id: String,
  pub status: String,
  pub date_valid_from: Option<String>,
  pub date_valid_to: Option<String>,
  pub individual: IndividualRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBeneficiary {
  pub id: String,
  pub status: String,
  pub date_valid_from: Option<String>,
  pub date_valid_to: Option<String>,
  pub group: GroupRef,
}

/// A beneficiary of either variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Beneficiary {
  Individual(IndividualBeneficiary),
  Group(GroupBeneficiary),
}

impl Beneficiary {
  pub fn id(&self) -> &str {
    match self {
      Beneficiary::Individual(b) => &b.id,
      Beneficiary::Group(b) => &b.id,
    }
  }

  /// Human readable label: "Last, First" or the group code.
  pub fn label(&self) -> String {
    match self {
      Beneficiary::Individual(b) => {
        format!("{}, {}", b.individual.last_name, b.individual.first_name)
      }
      Beneficiary::Group(b) => b.group.code.clone(),
    }
  }
}

/// Request for one page of beneficiaries
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
  pub variant: BeneficiaryVariant,
  pub filters: Vec<Filter>,
  pub order_by: Vec<String>,
  pub first: u32,
  pub offset: u64,
}

impl PageRequest {
  /// All arguments in wire order: filters, paging, ordering.
  pub fn arguments(&self) -> Vec<Filter> {
    let mut args = self.filters.clone();
    args.push(Filter::eq("first", self.first));
    args.push(Filter::eq(
      "offset",
      FilterValue::Int(i64::try_from(self.offset).unwrap_or(i64::MAX)),
    ));
    if !self.order_by.is_empty() {
      args.push(Filter::eq(
        "orderBy",
        FilterValue::List(
          self
            .order_by
            .iter()
            .map(|o| FilterValue::Str(o.clone()))
            .collect(),
        ),
      ));
    }
    args
  }
}
