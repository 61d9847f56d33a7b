//! Extracción de metadatos estructurados con el LLM alojado: asistentes con
//! búsqueda sobre ficheros para documentos y transcripciones, y el modelo de
//! visión para imágenes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::es_client::SearchClient;
use crate::llm_output::parse_embedded;
use crate::models::DocumentSummary;
use crate::openai::{
    AssistantUpdate, Message, MessageContent, OpenAiClient, Run, RunStatus, FILE_SEARCH,
};
use crate::poll::{poll_until, CancelSignal, PollSettings};

/// Mensaje que dispara la extracción en el hilo del asistente.
pub const TRIGGER_MESSAGE: &str = "Extract";

/// Límite de tokens de la respuesta del modelo de visión.
pub const IMAGE_MAX_TOKENS: u32 = 500;

pub const IMAGE_PROMPT: &str = r#"You are an image archivist. Examine the attached image and catalogue it.

Produce:
- Description: a thorough summary of what the image shows, its main visual elements, its theme and its apparent purpose, written for someone who has not seen it.
- Keywords: the core subjects, concepts, tools or technologies depicted.
- Domain: the field the content belongs to, for example Financial, Educational or Training.
- Author: the creator or source of the image, if it can be determined.
- Security: Low, Medium or High, according to how sensitive the content is.
- Type: the genre, for example Educational, Tutorial, Review, Commentary or Documentary.
- Complexity: an integer from 1 to 10, where 10 requires the most expertise to understand.
- Target Audience: the primary audience of the image.

Answer with a single JSON object and nothing else, using exactly this shape:
{
    "Document Description": {
        "Description": "..."
    },
    "Metadata": {
        "DOC_Keywords": ["..."],
        "Author": "...",
        "Domain": "...",
        "Type": "...",
        "Complexity": 5,
        "Security": "Low",
        "Target Audience": "..."
    }
}"#;

/// Origen de los resúmenes estructurados de los ficheros ingeridos.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Resume un documento con el asistente configurado bajo `assistant_name`.
    async fn describe_file(&self, path: &Path, assistant_name: &str) -> Result<DocumentSummary>;

    /// Resume una imagen con el modelo de visión.
    async fn describe_image(&self, path: &Path) -> Result<DocumentSummary>;
}

#[derive(Clone)]
pub struct MetadataExtractor {
    openai: Arc<OpenAiClient>,
    search: Arc<SearchClient>,
    poll: PollSettings,
}

impl MetadataExtractor {
    pub fn new(openai: Arc<OpenAiClient>, search: Arc<SearchClient>, poll: PollSettings) -> Self {
        Self {
            openai,
            search,
            poll,
        }
    }

    /// Espera a que el run llegue a un estado final (o pida herramientas).
    async fn wait_for_run(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        let openai = self.openai.as_ref();
        let run = poll_until(self.poll, &CancelSignal::never(), move || async move {
            let run = openai.retrieve_run(thread_id, run_id).await?;
            debug!("Run {} en estado {:?}", run.id, run.status);
            let done = run.status.is_terminal() || run.status == RunStatus::RequiresAction;
            Ok(done.then_some(run))
        })
        .await
        .with_context(|| format!("Esperando al run {run_id}"))?;

        let status = run.status;
        match status {
            RunStatus::Completed => Ok(run),
            RunStatus::RequiresAction => Err(anyhow!(
                "El run {run_id} pide herramientas que el extractor no ofrece"
            )),
            other => {
                let detail = run
                    .last_error
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_default();
                Err(anyhow!("El run {run_id} terminó en {other:?} {detail}"))
            }
        }
    }
}

/// Nombres de los ficheros citados en el mensaje, por id.
pub async fn cited_file_names(openai: &OpenAiClient, message: &Message) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for content in &message.content {
        let MessageContent::Text { text } = content else {
            continue;
        };
        for annotation in &text.annotations {
            let file_id = annotation
                .file_citation
                .as_ref()
                .map(|c| c.file_id.clone())
                .or_else(|| annotation.file_path.as_ref().map(|p| p.file_id.clone()));
            let Some(file_id) = file_id else { continue };
            if names.contains_key(&file_id) {
                continue;
            }
            match openai.retrieve_file(&file_id).await {
                Ok(file) => {
                    names.insert(file_id, file.filename);
                }
                Err(err) => warn!("No se pudo resolver el fichero citado {file_id}: {err}"),
            }
        }
    }
    names
}

/// Texto del primer bloque del mensaje con las anotaciones sustituidas por
/// marcas `【i†source】` y, al final, una nota por cada anotación.
pub fn render_reply(message: &Message, file_names: &HashMap<String, String>) -> String {
    let Some(text) = message.content.iter().find_map(|c| match c {
        MessageContent::Text { text } => Some(text),
        _ => None,
    }) else {
        return String::new();
    };

    let mut value = text.value.clone();
    let mut notes = Vec::new();
    for (index, annotation) in text.annotations.iter().enumerate() {
        let marker = format!("【{index}†source】");
        if !annotation.text.is_empty() {
            value = value.replace(&annotation.text, &marker);
        }
        let name_of = |id: &str| file_names.get(id).cloned().unwrap_or_else(|| id.to_string());
        if let Some(citation) = &annotation.file_citation {
            notes.push(format!(
                "{marker} {} from {}",
                citation.quote.as_deref().unwrap_or_default(),
                name_of(&citation.file_id)
            ));
        } else if let Some(file) = &annotation.file_path {
            notes.push(format!(
                "{marker} Click <here> to download {}",
                name_of(&file.file_id)
            ));
        }
    }

    let mut reply = value;
    reply.push('\n');
    reply.push_str(&notes.join("\n"));
    reply
}

#[async_trait]
impl MetadataSource for MetadataExtractor {
    async fn describe_file(&self, path: &Path, assistant_name: &str) -> Result<DocumentSummary> {
        let file = self.openai.upload_file(path).await?;
        let config = self.search.find_assistant(assistant_name).await?;
        let remote = self.openai.retrieve_assistant(&config.assistant_id).await?;

        self.openai
            .update_assistant(
                &config.assistant_id,
                &AssistantUpdate {
                    name: remote.name.clone(),
                    instructions: Some(config.prompt.clone()),
                    model: Some(self.openai.assistant_model.clone()),
                    tools: vec![FILE_SEARCH],
                },
            )
            .await?;

        let thread = self.openai.create_thread().await?;
        self.openai
            .create_message(&thread.id, TRIGGER_MESSAGE, std::slice::from_ref(&file.id))
            .await?;
        let run = self.openai.create_run(&thread.id, &config.assistant_id).await?;
        info!(
            "Extrayendo metadatos de {} con '{}' (run {})",
            path.display(),
            config.assistant_name,
            run.id
        );
        self.wait_for_run(&thread.id, &run.id).await?;

        let messages = self.openai.list_messages(&thread.id).await?;
        let reply = messages
            .iter()
            .find(|m| m.role == "assistant")
            .ok_or_else(|| anyhow!("El asistente no respondió en el hilo {}", thread.id))?;
        let names = cited_file_names(&self.openai, reply).await;
        let text = render_reply(reply, &names);

        let summary = parse_embedded::<DocumentSummary>(&text)
            .with_context(|| format!("Respuesta del asistente para {}", path.display()))?;
        Ok(summary)
    }

    async fn describe_image(&self, path: &Path) -> Result<DocumentSummary> {
        let text = self
            .openai
            .describe_image(IMAGE_PROMPT, path, IMAGE_MAX_TOKENS)
            .await?;
        let summary = parse_embedded::<DocumentSummary>(&text)
            .with_context(|| format!("Respuesta de visión para {}", path.display()))?;
        Ok(summary)
    }
}
