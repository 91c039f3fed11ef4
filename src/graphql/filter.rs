//! Structured query arguments rendered to GraphQL at the boundary.
//!
//! Filters are built from typed values and only turned into argument text
//! when a query is assembled, so values never need hand quoting.

use color_eyre::{eyre::eyre, Result};
use std::fmt::Write;

/// Lookup applied to a field, following the server's `field_Lookup` naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
  Exact,
  Icontains,
  Istartswith,
  Gte,
  Lte,
  In,
  Isnull,
}

impl Op {
  fn suffix(self) -> &'static str {
    match self {
      Op::Exact => "",
      Op::Icontains => "_Icontains",
      Op::Istartswith => "_Istartswith",
      Op::Gte => "_Gte",
      Op::Lte => "_Lte",
      Op::In => "_In",
      Op::Isnull => "_Isnull",
    }
  }
}

/// A GraphQL input value.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
  Str(String),
  Int(i64),
  Bool(bool),
  /// Enum literal, rendered unquoted (e.g. `ACTIVE`)
  Enum(String),
  List(Vec<FilterValue>),
}

impl From<&str> for FilterValue {
  fn from(s: &str) -> Self {
    FilterValue::Str(s.to_string())
  }
}

impl From<String> for FilterValue {
  fn from(s: String) -> Self {
    FilterValue::Str(s)
  }
}

impl From<bool> for FilterValue {
  fn from(b: bool) -> Self {
    FilterValue::Bool(b)
  }
}

impl From<i64> for FilterValue {
  fn from(n: i64) -> Self {
    FilterValue::Int(n)
  }
}

impl From<u32> for FilterValue {
  fn from(n: u32) -> Self {
    FilterValue::Int(i64::from(n))
  }
}

impl From<Vec<&str>> for FilterValue {
  fn from(items: Vec<&str>) -> Self {
    FilterValue::List(items.into_iter().map(FilterValue::from).collect())
  }
}

impl FilterValue {
  fn render(&self, out: &mut String) -> Result<()> {
    match self {
      FilterValue::Str(s) => {
        // JSON string escaping is a valid GraphQL string literal
        let quoted = serde_json::to_string(s).map_err(|e| eyre!("Failed to quote value: {}", e))?;
        out.push_str(&quoted);
      }
      FilterValue::Int(n) => {
        let _ = write!(out, "{}", n);
      }
      FilterValue::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
      FilterValue::Enum(name) => {
        validate_name(name)?;
        out.push_str(name);
      }
      FilterValue::List(items) => {
        out.push('[');
        for (i, item) in items.iter().enumerate() {
          if i > 0 {
            out.push_str(", ");
          }
          item.render(out)?;
        }
        out.push(']');
      }
    }
    Ok(())
  }
}

/// One `name: value` argument.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
  pub field: String,
  pub op: Op,
  pub value: FilterValue,
}

impl Filter {
  pub fn new(field: impl Into<String>, op: Op, value: impl Into<FilterValue>) -> Self {
    Self {
      field: field.into(),
      op,
      value: value.into(),
    }
  }

  pub fn eq(field: impl Into<String>, value: impl Into<FilterValue>) -> Self {
    Self::new(field, Op::Exact, value)
  }

  /// Argument name as sent to the server.
  pub fn argument_name(&self) -> String {
    format!("{}{}", self.field, self.op.suffix())
  }

  fn render(&self, out: &mut String) -> Result<()> {
    validate_name(&self.field)?;
    out.push_str(&self.argument_name());
    out.push_str(": ");
    self.value.render(out)
  }
}

/// Render filters as a comma-separated GraphQL argument list.
pub fn render_arguments(filters: &[Filter]) -> Result<String> {
  let mut out = String::new();
  for (i, filter) in filters.iter().enumerate() {
    if i > 0 {
      out.push_str(", ");
    }
    filter.render(&mut out)?;
  }
  Ok(out)
}

/// GraphQL names: `[_A-Za-z][_0-9A-Za-z]*`
fn validate_name(name: &str) -> Result<()> {
  let mut chars = name.chars();
  let valid = match chars.next() {
    Some(c) if c == '_' || c.is_ascii_alphabetic() => {
      chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
    }
    _ => false,
  };
  if valid {
    Ok(())
  } else {
    Err(eyre!("Invalid GraphQL name: {:?}", name))
  }
}
