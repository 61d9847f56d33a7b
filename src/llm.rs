//! Completados de chat sobre Rig: selección de palabras clave y dominios para
//! construir el filtro de recuperación.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::Prompt;
use rig::providers::openai;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::document_store::RetrievalFilter;
use crate::llm_output::{parse_embedded, LlmOutputError};

const SELECTION_PROMPT: &str = r#"
You help route a user's question to the right documents of a knowledge base.
You receive the question, the list of keywords and the list of domains that exist in the index.
Pick the keywords and domains from those lists that are relevant to the question.
Only use values that appear verbatim in the lists. If nothing is relevant, return empty lists.

The output MUST be a single valid JSON object with exactly two keys and no explanations:
{"Keywords": ["..."], "Domains": ["..."]}
"#;

/// Palabras clave y dominios elegidos por el modelo.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TermSelection {
    #[serde(rename = "Keywords", alias = "keywords", default)]
    pub keywords: Vec<String>,
    #[serde(rename = "Domains", alias = "domains", default)]
    pub domains: Vec<String>,
}

impl TermSelection {
    /// Descarta los valores que no existen en el índice.
    pub fn restrict_to(mut self, keywords: &BTreeSet<String>, domains: &BTreeSet<String>) -> Self {
        self.keywords.retain(|k| keywords.contains(k));
        self.domains.retain(|d| domains.contains(d));
        self
    }

    pub fn into_filter(self) -> RetrievalFilter {
        RetrievalFilter::new(self.domains, self.keywords)
    }
}

/// Selección de términos de búsqueda a partir de una pregunta.
#[async_trait]
pub trait TermSelector: Send + Sync {
    async fn select_terms(
        &self,
        question: &str,
        keywords: &BTreeSet<String>,
        domains: &BTreeSet<String>,
    ) -> Result<TermSelection>;
}

pub fn selection_request(
    question: &str,
    keywords: &BTreeSet<String>,
    domains: &BTreeSet<String>,
) -> Result<String> {
    let keywords = serde_json::to_string(keywords)?;
    let domains = serde_json::to_string(domains)?;
    Ok(format!(
        "Keywords: {keywords}\nDomains: {domains}\n\nUser question:\n{question}"
    ))
}

pub fn parse_selection(reply: &str) -> Result<TermSelection, LlmOutputError> {
    parse_embedded::<TermSelection>(reply)
}

/// Gestor del LLM de chat.
#[derive(Clone)]
pub struct LlmManager {
    client: openai::Client,
    pub chat_model: String,
}

impl LlmManager {
    /// Construye el cliente una sola vez a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let client = openai::Client::builder(&cfg.openai_api_key)
            .base_url(cfg.openai_base_url.trim_end_matches('/'))
            .build();
        Ok(Self {
            client,
            chat_model: cfg.llm_chat_model.clone(),
        })
    }

    async fn complete(&self, preamble: &str, prompt: &str) -> Result<String> {
        // Trait para client.completion_model(...)
        use rig::client::CompletionClient as _;

        // Chat Completions en lugar de la API de Responses
        let model = self
            .client
            .completion_model(&self.chat_model)
            .completions_api();
        let agent = AgentBuilder::new(model).preamble(preamble).build();
        let answer = agent
            .prompt(prompt)
            .await
            .context("Fallo en el completado de chat")?;
        Ok(answer)
    }
}

#[async_trait]
impl TermSelector for LlmManager {
    async fn select_terms(
        &self,
        question: &str,
        keywords: &BTreeSet<String>,
        domains: &BTreeSet<String>,
    ) -> Result<TermSelection> {
        let request = selection_request(question, keywords, domains)?;
        let reply = self.complete(SELECTION_PROMPT, &request).await?;
        debug!("Respuesta de selección: {reply}");
        let selection = parse_selection(&reply)
            .context("La selección de términos no es un JSON válido")?
            .restrict_to(keywords, domains);
        info!(
            "Seleccionados {} keywords y {} dominios",
            selection.keywords.len(),
            selection.domains.len()
        );
        Ok(selection)
    }
}
