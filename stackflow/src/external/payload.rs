//! Typed payloads, validated before a request is dispatched.

use crate::errors::PayloadError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::LazyLock;

/// A schema-checked worker payload.
pub trait ResourcePayload: Send + Sync + std::fmt::Debug {
    /// Payload kind, stored on the resource.
    fn kind(&self) -> &str;

    /// Checks the payload before dispatch.
    ///
    /// # Errors
    ///
    /// Returns a `PayloadError` naming the offending field.
    fn validate(&self) -> Result<(), PayloadError>;

    /// The document sent to the worker.
    fn to_document(&self) -> serde_json::Value;
}

/// An untyped document, accepted as long as it is a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPayload {
    /// Payload kind.
    pub kind: String,
    /// The document.
    pub document: serde_json::Value,
}

impl DocumentPayload {
    /// Creates a document payload.
    #[must_use]
    pub fn new(kind: impl Into<String>, document: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            document,
        }
    }
}

impl ResourcePayload for DocumentPayload {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn validate(&self) -> Result<(), PayloadError> {
        if self.document.is_object() {
            Ok(())
        } else {
            Err(PayloadError::new(&self.kind, "document", "must be a JSON object"))
        }
    }

    fn to_document(&self) -> serde_json::Value {
        self.document.clone()
    }
}

/// Which search offering an endpoint belongs to. Decides the request signing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchService {
    /// Serverless collection (`aoss`).
    Serverless,
    /// Managed domain (`es`).
    Managed,
}

impl SearchService {
    /// Derives the service from an endpoint host.
    #[must_use]
    pub fn from_endpoint(endpoint: &str) -> Self {
        if endpoint.contains("aoss") {
            Self::Serverless
        } else {
            Self::Managed
        }
    }

    /// Signing service name.
    #[must_use]
    pub const fn signing_name(&self) -> &'static str {
        match self {
            Self::Serverless => "aoss",
            Self::Managed => "es",
        }
    }
}

/// Default embedding dimensionality of a vector index.
pub const DEFAULT_VECTOR_DIMENSION: u32 = 1024;

/// Largest dimensionality a k-NN vector field accepts.
pub const MAX_VECTOR_DIMENSION: u32 = 16_000;

#[allow(clippy::expect_used)]
static INDEX_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9._+-]{0,254}$").expect("index name pattern is valid")
});

/// A vector search index inside a search cluster or collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndexPayload {
    /// Cluster or collection endpoint host.
    pub endpoint: String,
    /// Index name.
    pub index_name: String,
    /// Embedding dimensionality.
    #[serde(default = "default_vector_dimension")]
    pub vector_dimension: u32,
}

fn default_vector_dimension() -> u32 {
    DEFAULT_VECTOR_DIMENSION
}

impl SearchIndexPayload {
    /// Payload kind.
    pub const KIND: &'static str = "search_index";

    /// Creates a payload with the default dimensionality.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            index_name: index_name.into(),
            vector_dimension: DEFAULT_VECTOR_DIMENSION,
        }
    }

    /// Sets the dimensionality.
    #[must_use]
    pub fn with_vector_dimension(mut self, dimension: u32) -> Self {
        self.vector_dimension = dimension;
        self
    }

    /// Service the endpoint belongs to.
    #[must_use]
    pub fn service(&self) -> SearchService {
        SearchService::from_endpoint(&self.endpoint)
    }

    /// Index settings and mappings: k-NN enabled, a text field, an HNSW vector
    /// field and a free-form metadata object.
    #[must_use]
    pub fn index_definition(&self) -> serde_json::Value {
        json!({
            "settings": {
                "index": { "knn": true }
            },
            "mappings": {
                "properties": {
                    "text": { "type": "text" },
                    "vector_field": {
                        "type": "knn_vector",
                        "dimension": self.vector_dimension,
                        "method": {
                            "engine": "nmslib",
                            "name": "hnsw",
                            "space_type": "l2"
                        }
                    },
                    "metadata": { "type": "object" }
                }
            }
        })
    }
}

impl ResourcePayload for SearchIndexPayload {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn validate(&self) -> Result<(), PayloadError> {
        if self.endpoint.trim().is_empty() {
            return Err(PayloadError::new(Self::KIND, "endpoint", "cannot be empty"));
        }
        if self.endpoint.contains("://") || self.endpoint.contains('/') {
            return Err(PayloadError::new(
                Self::KIND,
                "endpoint",
                "must be a bare host without scheme or path",
            ));
        }
        if !INDEX_NAME.is_match(&self.index_name) {
            return Err(PayloadError::new(
                Self::KIND,
                "index_name",
                "must be lowercase, without spaces, and start with a letter or digit",
            ));
        }
        if !(1..=MAX_VECTOR_DIMENSION).contains(&self.vector_dimension) {
            return Err(PayloadError::new(
                Self::KIND,
                "vector_dimension",
                format!("must be between 1 and {MAX_VECTOR_DIMENSION}"),
            ));
        }
        Ok(())
    }

    fn to_document(&self) -> serde_json::Value {
        json!({
            "endpoint": self.endpoint,
            "index_name": self.index_name,
            "vector_dimension": self.vector_dimension,
            "service": self.service().signing_name(),
            "index": self.index_definition(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_service_from_endpoint() {
        let serverless = SearchIndexPayload::new("abc123.us-east-1.aoss.amazonaws.com", "docs");
        let managed = SearchIndexPayload::new("search-rag.us-east-1.es.amazonaws.com", "docs");

        assert_eq!(serverless.service(), SearchService::Serverless);
        assert_eq!(managed.service().signing_name(), "es");
    }

    #[test]
    fn test_document_carries_knn_definition() {
        let payload = SearchIndexPayload::new("abc.aoss.amazonaws.com", "docs").with_vector_dimension(768);
        let document = payload.to_document();

        assert_eq!(document["service"], json!("aoss"));
        assert_eq!(document["index"]["settings"]["index"]["knn"], json!(true));
        let vector = &document["index"]["mappings"]["properties"]["vector_field"];
        assert_eq!(vector["dimension"], json!(768));
        assert_eq!(vector["method"]["name"], json!("hnsw"));
        assert_eq!(vector["method"]["engine"], json!("nmslib"));
        assert_eq!(vector["method"]["space_type"], json!("l2"));
    }

    #[test]
    fn test_default_dimension_on_deserialize() {
        let payload: SearchIndexPayload =
            serde_json::from_str(r#"{"endpoint": "host", "index_name": "docs"}"#).unwrap();
        assert_eq!(payload.vector_dimension, 1024);
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let ok = SearchIndexPayload::new("abc.aoss.amazonaws.com", "rag-docs_v1");
        assert!(ok.validate().is_ok());

        let cases = [
            (SearchIndexPayload::new("", "docs"), "endpoint"),
            (SearchIndexPayload::new("https://host/path", "docs"), "endpoint"),
            (SearchIndexPayload::new("host", "Docs"), "index_name"),
            (SearchIndexPayload::new("host", "my docs"), "index_name"),
            (SearchIndexPayload::new("host", "_internal"), "index_name"),
            (SearchIndexPayload::new("host", "docs").with_vector_dimension(0), "vector_dimension"),
            (SearchIndexPayload::new("host", "docs").with_vector_dimension(16_001), "vector_dimension"),
        ];
        for (payload, field) in cases {
            assert_eq!(payload.validate().unwrap_err().field, field, "{payload:?}");
        }
    }

    #[test]
    fn test_document_payload_requires_object() {
        assert!(DocumentPayload::new("queue", json!({"name": "jobs"})).validate().is_ok());
        assert!(DocumentPayload::new("queue", json!("jobs")).validate().is_err());
    }
}
