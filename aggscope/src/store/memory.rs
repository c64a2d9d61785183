//! In-process document store
//!
//! Holds JSON documents grouped by index and evaluates aggregation requests
//! locally. Used by the CLI and by tests in place of a search cluster.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;

use super::eval::{self, Document};
use super::DocumentStore;
use crate::error::AggError;
use crate::query::types::AggregationRequest;
use crate::response::AggregationResponse;
use crate::Result;

#[derive(Default)]
pub struct MemoryStore {
    indices: RwLock<HashMap<String, Vec<Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `index` if it does not exist yet.
    pub fn create_index(&self, index: &str) {
        self.indices.write().entry(index.to_string()).or_default();
    }

    /// Append documents to `index`, creating it on first use.
    ///
    /// Documents without an `_id` get their position in the index.
    pub fn index_documents<I>(&self, index: &str, docs: I) -> Result<usize>
    where
        I: IntoIterator<Item = Value>,
    {
        let mut parsed = Vec::new();
        for doc in docs {
            match doc {
                Value::Object(map) => parsed.push(map),
                other => {
                    return Err(AggError::InvalidQuery(format!(
                        "documents must be JSON objects, got {}",
                        other
                    )))
                }
            }
        }

        let mut indices = self.indices.write();
        let stored = indices.entry(index.to_string()).or_default();
        let added = parsed.len();
        for mut doc in parsed {
            if !doc.contains_key("_id") {
                doc.insert("_id".to_string(), Value::String(stored.len().to_string()));
            }
            stored.push(doc);
        }
        tracing::debug!(index, added, total = stored.len(), "Indexed documents");
        Ok(added)
    }

    /// Index newline-delimited JSON; blank lines are skipped.
    pub fn index_jsonl(&self, index: &str, content: &str) -> Result<usize> {
        let docs = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<Value>)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.index_documents(index, docs)
    }

    /// Index a JSON lines file.
    pub fn load_jsonl(&self, index: &str, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read documents from {:?}", path))?;
        let added = self
            .index_jsonl(index, &content)
            .with_context(|| format!("Failed to index {:?} into '{}'", path, index))?;
        tracing::info!(index, path = ?path, added, "Loaded documents");
        Ok(added)
    }

    /// Index names, sorted.
    pub fn indices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indices.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn doc_count(&self, index: &str) -> Option<usize> {
        self.indices.read().get(index).map(Vec::len)
    }

    fn evaluate(
        &self,
        request: &AggregationRequest,
        indices: &[String],
    ) -> Result<AggregationResponse> {
        let start = Instant::now();
        let stored = self.indices.read();

        let mut docs: Vec<&Document> = Vec::new();
        for name in indices {
            let index = stored
                .get(name)
                .ok_or_else(|| AggError::IndexNotFound(name.clone()))?;
            docs.extend(index.iter());
        }

        let matched = match &request.query {
            Some(query) => eval::filter(query, &docs)?,
            None => docs,
        };
        let aggregations = eval::aggregate_all(&request.aggs, &matched)?;

        Ok(AggregationResponse {
            took: start.elapsed().as_millis() as u64,
            total: matched.len() as u64,
            aggregations,
        })
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn execute(
        &self,
        request: &AggregationRequest,
        indices: &[String],
    ) -> Result<AggregationResponse> {
        if indices.is_empty() {
            return Err(AggError::InvalidQuery(
                "request names no index".to_string(),
            ));
        }
        let response = self.evaluate(request, indices)?;
        tracing::debug!(
            indices = ?indices,
            total = response.total,
            took_ms = response.took,
            "Executed aggregation request"
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::types::{AggregationKind, AggregationNode, FieldAgg, Query};
    use crate::response::AggregationOutput;
    use serde_json::json;
    use std::io::Write;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .index_documents(
                "policy",
                vec![
                    json!({"risk_code": "0101", "premium": 100.0}),
                    json!({"risk_code": "0103", "premium": 150.0}),
                ],
            )
            .unwrap();
        store
            .index_documents("policy_2019", vec![json!({"risk_code": "0101", "premium": 200.0})])
            .unwrap();
        store
    }

    fn sum_request(query: Option<Query>) -> AggregationRequest {
        AggregationRequest::new(query).with_agg(
            "metric",
            AggregationNode::new(AggregationKind::Sum(FieldAgg::new("premium"))),
        )
    }

    #[tokio::test]
    async fn test_execute_across_indices() {
        let store = store();
        let resp = store
            .execute(
                &sum_request(None),
                &["policy".to_string(), "policy_2019".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(resp.total, 3);
        assert_eq!(
            resp.get("metric"),
            Some(&AggregationOutput::Value { value: Some(450.0) })
        );
    }

    #[tokio::test]
    async fn test_execute_applies_query() {
        let store = store();
        let resp = store
            .execute(
                &sum_request(Some(Query::term("risk_code", "0103"))),
                &["policy".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(resp.total, 1);
        assert_eq!(
            resp.get("metric"),
            Some(&AggregationOutput::Value { value: Some(150.0) })
        );
    }

    #[tokio::test]
    async fn test_unknown_index() {
        let store = store();
        let err = store
            .execute(&sum_request(None), &["ghost".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, AggError::IndexNotFound(i) if i == "ghost"));
    }

    #[test]
    fn test_ids_assigned_and_non_objects_rejected() {
        let store = MemoryStore::new();
        store
            .index_documents("t", vec![json!({"a": 1}), json!({"_id": "x", "a": 2})])
            .unwrap();
        let ids: Vec<Value> = store.indices.read()["t"]
            .iter()
            .map(|d| d["_id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("0"), json!("x")]);

        assert!(store.index_documents("t", vec![json!([1, 2])]).is_err());
        assert_eq!(store.doc_count("t"), Some(2));
    }

    #[test]
    fn test_load_jsonl() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{\"premium\": 1}}").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{{\"premium\": 2}}").unwrap();

        let store = MemoryStore::new();
        assert_eq!(store.load_jsonl("p", file.path()).unwrap(), 2);
        assert_eq!(store.indices(), vec!["p"]);
    }

    #[test]
    fn test_load_jsonl_bad_line() {
        let store = MemoryStore::new();
        assert!(store.index_jsonl("p", "{\"premium\": 1}\nnot json\n").is_err());
        assert_eq!(store.doc_count("p"), None);
    }
}
