//! Colección de registros de metadatos: indexado, facetas (palabras clave y
//! dominios) y filtrado de documentos para la recuperación.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::es_client::SearchClient;
use crate::models::{DocumentRecord, IndexedDocument};

/// Tamaño de las agregaciones de facetas.
pub const FACET_SIZE: usize = 10_000;
/// Máximo de documentos devueltos por un filtrado.
pub const FILTER_LIMIT: usize = 1000;

/// Destino de los registros producidos por la ingesta.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn index_document(&self, record: &DocumentRecord) -> Result<String>;
}

#[async_trait]
impl DocumentSink for SearchClient {
    async fn index_document(&self, record: &DocumentRecord) -> Result<String> {
        let id = self.index_source(&self.document_index, record).await?;
        info!("Documento '{}' indexado con id {}", record.name, id);
        Ok(id)
    }
}

/// Selección de dominios y palabras clave que deben cumplir los documentos.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RetrievalFilter {
    #[serde(rename = "Domains", alias = "domains", default)]
    pub domains: Vec<String>,
    #[serde(rename = "Keywords", alias = "keywords", default)]
    pub keywords: Vec<String>,
}

impl RetrievalFilter {
    pub fn new(domains: Vec<String>, keywords: Vec<String>) -> Self {
        Self { domains, keywords }
    }

    /// Sin dominios o sin palabras clave ningún documento puede cumplir el filtro.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() || self.keywords.is_empty()
    }

    /// Consulta booleana: algún dominio Y alguna palabra clave, ambos sobre `Metadata`.
    pub fn to_query(&self) -> Value {
        let should: Vec<Value> = self
            .domains
            .iter()
            .map(|domain| json!({ "match": { "Metadata.Domain": domain } }))
            .collect();
        json!({
            "size": FILTER_LIMIT,
            "query": {
                "bool": {
                    "must": [
                        {
                            "nested": {
                                "path": "Metadata",
                                "query": {
                                    "bool": { "should": should, "minimum_should_match": 1 }
                                }
                            }
                        },
                        {
                            "nested": {
                                "path": "Metadata",
                                "query": {
                                    "bool": {
                                        "must": [
                                            { "terms": { "Metadata.DOC_Keywords": self.keywords } }
                                        ]
                                    }
                                }
                            }
                        }
                    ]
                }
            }
        })
    }

    /// Revisión local del filtro sobre un registro devuelto por el buscador.
    pub fn matches(&self, record: &DocumentRecord) -> bool {
        let metadata = &record.summary.metadata;
        let domain_ok = self
            .domains
            .iter()
            .any(|d| d.trim().eq_ignore_ascii_case(metadata.domain.trim()));
        let keyword_ok = self.keywords.iter().any(|k| metadata.keywords.contains(k));
        domain_ok && keyword_ok
    }
}

/// Agregación de valores distintos de un campo anidado de `Metadata`.
pub fn facet_query(field: &str) -> Value {
    json!({
        "size": 0,
        "aggs": {
            "nested_metadata": {
                "nested": { "path": "Metadata" },
                "aggs": {
                    "unique_values": { "terms": { "field": field, "size": FACET_SIZE } }
                }
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct FacetResponse {
    aggregations: FacetAggregations,
}

#[derive(Debug, Deserialize)]
struct FacetAggregations {
    nested_metadata: NestedFacet,
}

#[derive(Debug, Deserialize)]
struct NestedFacet {
    unique_values: Buckets,
}

#[derive(Debug, Deserialize)]
struct Buckets {
    #[serde(default)]
    buckets: Vec<Bucket>,
}

#[derive(Debug, Deserialize)]
struct Bucket {
    key: Value,
}

impl SearchClient {
    async fn facet(&self, field: &str) -> Result<BTreeSet<String>> {
        let resp: FacetResponse = self
            .search_raw(&self.document_index, &facet_query(field))
            .await?;
        let values = resp
            .aggregations
            .nested_metadata
            .unique_values
            .buckets
            .into_iter()
            .map(|b| match b.key {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect();
        Ok(values)
    }

    pub async fn unique_keywords(&self) -> Result<BTreeSet<String>> {
        self.facet("Metadata.DOC_Keywords").await
    }

    pub async fn unique_domains(&self) -> Result<BTreeSet<String>> {
        self.facet("Metadata.Domain.keyword").await
    }

    /// Documentos que cumplen el filtro. Un filtro vacío no llega al buscador.
    pub async fn filter_documents(&self, filter: &RetrievalFilter) -> Result<Vec<IndexedDocument>> {
        if filter.is_empty() {
            debug!("Filtro vacío, no se consulta el índice");
            return Ok(Vec::new());
        }
        let hits = self
            .search::<DocumentRecord>(&self.document_index, &filter.to_query())
            .await?;
        let total = hits.len();
        let docs: Vec<IndexedDocument> = hits
            .into_iter()
            .filter(|hit| filter.matches(&hit.source))
            .map(|hit| IndexedDocument {
                id: hit.id,
                record: hit.source,
            })
            .collect();
        debug!("Filtrado: {} de {} resultados cumplen la selección", docs.len(), total);
        Ok(docs)
    }
}
