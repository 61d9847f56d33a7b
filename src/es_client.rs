//! Cliente HTTP mínimo para Elasticsearch: índices, búsquedas y la colección
//! de configuraciones de asistentes.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::models::AssistantConfig;

/// Máximo de configuraciones devueltas por un listado.
pub const LIST_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct SearchClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    pub assistant_index: String,
    pub document_index: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchResponse<T> {
    pub hits: Hits<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Hits<T> {
    #[serde(default = "Vec::new")]
    pub hits: Vec<Hit<T>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Hit<T> {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source")]
    pub source: T,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(rename = "_id")]
    id: String,
}

impl SearchClient {
    pub fn new(
        endpoint: &str,
        api_key: &str,
        assistant_index: &str,
        document_index: &str,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("No se pudo construir el cliente HTTP de Elasticsearch")?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            assistant_index: assistant_index.to_string(),
            document_index: document_index.to_string(),
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Self::new(
            &cfg.es_endpoint,
            &cfg.es_api_key,
            &cfg.assistant_index,
            &cfg.document_index,
        )
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.endpoint, path.trim_start_matches('/'));
        self.http
            .request(method, url)
            .header("Authorization", format!("ApiKey {}", self.api_key))
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder, what: &str) -> Result<T> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Fallo de red en Elasticsearch ({what})"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Elasticsearch respondió {status} en {what}: {body}"));
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("Respuesta inesperada de Elasticsearch ({what})"))
    }

    /// Comprueba que el clúster responde.
    pub async fn ping(&self) -> Result<()> {
        let _: Value = Self::send(self.request(Method::GET, "/"), "ping").await?;
        Ok(())
    }

    /// Crea los dos índices con sus mappings si aún no existen.
    pub async fn ensure_indices(&self) -> Result<()> {
        self.ensure_index(&self.assistant_index, assistant_mappings())
            .await?;
        self.ensure_index(&self.document_index, document_mappings())
            .await?;
        Ok(())
    }

    /// Devuelve `true` si el índice se ha creado en esta llamada.
    pub async fn ensure_index(&self, index: &str, mappings: Value) -> Result<bool> {
        let resp = self
            .request(Method::HEAD, index)
            .send()
            .await
            .with_context(|| format!("No se pudo comprobar el índice {index}"))?;
        match resp.status() {
            s if s.is_success() => {
                debug!("El índice {index} ya existe");
                Ok(false)
            }
            StatusCode::NOT_FOUND => {
                let _: Value = Self::send(
                    self.request(Method::PUT, index).json(&mappings),
                    "creación de índice",
                )
                .await?;
                info!("Índice {index} creado");
                Ok(true)
            }
            other => Err(anyhow!(
                "Estado inesperado {other} comprobando el índice {index}"
            )),
        }
    }

    /// Búsqueda con la respuesta completa deserializada al tipo pedido.
    pub(crate) async fn search_raw<R: DeserializeOwned>(&self, index: &str, body: &Value) -> Result<R> {
        Self::send(
            self.request(Method::POST, &format!("{index}/_search")).json(body),
            "búsqueda",
        )
        .await
    }

    pub(crate) async fn search<T: DeserializeOwned>(
        &self,
        index: &str,
        body: &Value,
    ) -> Result<Vec<Hit<T>>> {
        let resp: SearchResponse<T> = self.search_raw(index, body).await?;
        Ok(resp.hits.hits)
    }

    pub(crate) async fn index_source<T: Serialize + ?Sized>(
        &self,
        index: &str,
        source: &T,
    ) -> Result<String> {
        let resp: WriteResponse = Self::send(
            self.request(Method::POST, &format!("{index}/_doc")).json(source),
            "indexado",
        )
        .await?;
        Ok(resp.id)
    }

    // ---------------------------------------------------------------------
    // CONFIGURACIONES DE ASISTENTES
    // ---------------------------------------------------------------------

    pub async fn list_assistants(&self) -> Result<Vec<AssistantConfig>> {
        let hits = self
            .search::<AssistantConfig>(&self.assistant_index, &list_all_query(LIST_LIMIT))
            .await?;
        Ok(hits.into_iter().map(into_config).collect())
    }

    pub async fn find_assistant_exact(&self, name: &str) -> Result<Option<AssistantConfig>> {
        let hits = self
            .search::<AssistantConfig>(&self.assistant_index, &exact_name_query(name))
            .await?;
        Ok(hits.into_iter().next().map(into_config))
    }

    pub async fn find_assistant_fuzzy(&self, name: &str) -> Result<Option<AssistantConfig>> {
        let hits = self
            .search::<AssistantConfig>(&self.assistant_index, &fuzzy_name_query(name))
            .await?;
        Ok(hits.into_iter().next().map(into_config))
    }

    /// Busca por nombre exacto y, si no hay coincidencia, por nombre aproximado.
    pub async fn find_assistant(&self, name: &str) -> Result<AssistantConfig> {
        if let Some(config) = self.find_assistant_exact(name).await? {
            return Ok(config);
        }
        warn!("Sin coincidencia exacta para el asistente '{name}', probando búsqueda aproximada");
        self.find_assistant_fuzzy(name)
            .await?
            .ok_or_else(|| anyhow!("No existe ninguna configuración para el asistente '{name}'"))
    }

    /// Guarda la configuración; si no tiene id se crea un documento nuevo.
    pub async fn upsert_assistant(&self, config: &AssistantConfig) -> Result<String> {
        if config.id.is_empty() {
            return self.index_source(&self.assistant_index, config).await;
        }
        let body = json!({ "doc": config, "doc_as_upsert": true });
        let resp: WriteResponse = Self::send(
            self.request(
                Method::POST,
                &format!("{}/_update/{}", self.assistant_index, config.id),
            )
            .json(&body),
            "actualización de asistente",
        )
        .await?;
        Ok(resp.id)
    }

    pub async fn delete_assistant(&self, id: &str) -> Result<()> {
        let _: Value = Self::send(
            self.request(
                Method::DELETE,
                &format!("{}/_doc/{}", self.assistant_index, id),
            ),
            "borrado de asistente",
        )
        .await?;
        info!("Configuración de asistente {id} eliminada");
        Ok(())
    }
}

fn into_config(hit: Hit<AssistantConfig>) -> AssistantConfig {
    AssistantConfig {
        id: hit.id,
        ..hit.source
    }
}

pub fn list_all_query(size: usize) -> Value {
    json!({ "size": size, "query": { "match_all": {} } })
}

pub fn exact_name_query(name: &str) -> Value {
    json!({ "query": { "term": { "assistant_name.keyword": name } } })
}

pub fn fuzzy_name_query(name: &str) -> Value {
    json!({
        "query": {
            "match": {
                "assistant_name": { "query": name, "fuzziness": "AUTO" }
            }
        }
    })
}

fn assistant_mappings() -> Value {
    json!({
        "mappings": {
            "properties": {
                "assistant_id": { "type": "keyword" },
                "assistant_name": {
                    "type": "text",
                    "fields": { "keyword": { "type": "keyword" } }
                },
                "Prompt": { "type": "text" }
            }
        }
    })
}

fn text_with_keyword() -> Value {
    json!({ "type": "text", "fields": { "keyword": { "type": "keyword", "ignore_above": 256 } } })
}

fn document_mappings() -> Value {
    json!({
        "mappings": {
            "properties": {
                "Document Name": text_with_keyword(),
                "Document Source": { "type": "keyword" },
                "Data Type": { "type": "keyword" },
                "Video Source": { "type": "keyword" },
                "Audio Source": { "type": "keyword" },
                "Video Id": { "type": "keyword" },
                "Metadata": {
                    "type": "nested",
                    "properties": {
                        "DOC_Keywords": { "type": "keyword" },
                        "Author": text_with_keyword(),
                        "Domain": text_with_keyword(),
                        "Type": text_with_keyword(),
                        "Complexity": { "type": "integer" },
                        "Security": { "type": "keyword" },
                        "Target Audience": text_with_keyword()
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> SearchClient {
        SearchClient::new(&server.uri(), "es-key", "ikms-assistants", "meta-summary-registry")
            .expect("cliente")
    }

    fn hits(items: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "hits": { "hits": items } }))
    }

    #[tokio::test]
    async fn exact_match_wins_without_fuzzy_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ikms-assistants/_search"))
            .and(header("Authorization", "ApiKey es-key"))
            .and(body_partial_json(exact_name_query("Meta Doc Creator")))
            .respond_with(hits(json!([{
                "_id": "cfg-1",
                "_source": {"assistant_id": "asst_1", "assistant_name": "Meta Doc Creator", "Prompt": "Resume"}
            }])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ikms-assistants/_search"))
            .and(body_partial_json(fuzzy_name_query("Meta Doc Creator")))
            .respond_with(hits(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let config = client(&server).find_assistant("Meta Doc Creator").await.expect("config");
        assert_eq!(config.id, "cfg-1");
        assert_eq!(config.assistant_id, "asst_1");
        assert_eq!(config.prompt, "Resume");
    }

    #[tokio::test]
    async fn falls_back_to_fuzzy_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ikms-assistants/_search"))
            .and(body_partial_json(exact_name_query("Meta Doc Creater")))
            .respond_with(hits(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ikms-assistants/_search"))
            .and(body_partial_json(fuzzy_name_query("Meta Doc Creater")))
            .respond_with(hits(json!([{
                "_id": "cfg-9",
                "_source": {"assistant_id": "asst_9", "assistant_name": "Meta Doc Creator"}
            }])))
            .mount(&server)
            .await;

        let config = client(&server).find_assistant("Meta Doc Creater").await.expect("config");
        assert_eq!(config.assistant_id, "asst_9");
        assert!(config.prompt.is_empty());
    }

    #[tokio::test]
    async fn missing_assistant_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ikms-assistants/_search"))
            .respond_with(hits(json!([])))
            .mount(&server)
            .await;

        let err = client(&server).find_assistant("Nadie").await.expect_err("debe fallar");
        assert!(err.to_string().contains("Nadie"));
    }

    #[tokio::test]
    async fn existing_config_is_updated_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ikms-assistants/_update/cfg-1"))
            .and(body_partial_json(json!({"doc": {"assistant_name": "Meta Doc Creator", "Prompt": "Nuevo"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_id": "cfg-1", "result": "updated"})))
            .expect(1)
            .mount(&server)
            .await;

        let config = AssistantConfig {
            id: "cfg-1".into(),
            assistant_id: "asst_1".into(),
            assistant_name: "Meta Doc Creator".into(),
            prompt: "Nuevo".into(),
        };
        let id = client(&server).upsert_assistant(&config).await.expect("upsert");
        assert_eq!(id, "cfg-1");
    }

    #[tokio::test]
    async fn missing_index_is_created_with_mappings() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/ikms-assistants"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/meta-summary-registry"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/meta-summary-registry"))
            .and(body_partial_json(json!({"mappings": {"properties": {"Metadata": {"type": "nested"}}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/ikms-assistants"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        client(&server).ensure_indices().await.expect("índices");
    }
}
