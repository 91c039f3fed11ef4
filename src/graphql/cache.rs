//! Cache keys for GraphQL queries.

use sha2::{Digest, Sha256};

/// Stable key for a raw query: SHA-256 of the query with whitespace collapsed.
pub fn query_cache_key(query: &str) -> String {
  let normalized = normalize_query(query);

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(b"query:");
  hasher.update(normalized.as_bytes());
  hex::encode(hasher.finalize())
}

/// Collapse runs of whitespace so formatting changes don't split the cache.
fn normalize_query(query: &str) -> String {
  query.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_formatting_does_not_change_key() {
    let compact = "{ dashboard { total } }";
    let pretty = "{\n  dashboard {\n    total\n  }\n}\n";
    assert_eq!(query_cache_key(compact), query_cache_key(pretty));
    assert_eq!(query_cache_key(compact).len(), 64);
  }

  #[test]
  fn test_different_queries_differ() {
    assert_ne!(
      query_cache_key("{ dashboard { total } }"),
      query_cache_key("{ dashboard { active } }")
    );
  }
}
