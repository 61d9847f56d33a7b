//! Cliente HTTP de la API de OpenAI para lo que Rig no cubre: ficheros,
//! asistentes, hilos, mensajes, runs, visión y transcripción.
//!
//! Las cargas remotas se decodifican una sola vez en tipos explícitos; las
//! llamadas a herramientas quedan en el enum etiquetado [`ToolCall`].

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::AppConfig;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Cliente de la API (una instancia por proceso).
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    pub assistant_model: String,
    pub vision_model: String,
    pub transcription_model: String,
}

// --- Tipos de la API ---

#[derive(Debug, Clone, Deserialize)]
pub struct FileObject {
    pub id: String,
    #[serde(default)]
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Assistant {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub model: String,
}

/// Cambios a aplicar sobre un asistente remoto.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssistantUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolSpec {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// Herramienta de búsqueda sobre ficheros adjuntos.
pub const FILE_SEARCH: ToolSpec = ToolSpec { kind: "file_search" };

#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: Vec<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextContent },
    ImageFile { image_file: FileRef },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextContent {
    pub value: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub file_citation: Option<FileCitation>,
    #[serde(default)]
    pub file_path: Option<FileRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileCitation {
    pub file_id: String,
    #[serde(default)]
    pub quote: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FileRef {
    pub file_id: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Completed
                | RunStatus::Incomplete
                | RunStatus::Expired
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequiredAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub submit_tool_outputs: Option<SubmitToolOutputs>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitToolOutputs {
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunStep {
    pub id: String,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub completed_at: Option<i64>,
    pub step_details: StepDetails,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDetails {
    MessageCreation { message_creation: MessageCreationRef },
    ToolCalls { tool_calls: Vec<ToolCall> },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageCreationRef {
    pub message_id: String,
}

/// Llamada a herramienta hecha por el asistente durante un run.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolCall {
    CodeInterpreter {
        id: String,
        code_interpreter: CodeInterpreterCall,
    },
    #[serde(rename = "file_search", alias = "retrieval")]
    Retrieval { id: String },
    Function { id: String, function: FunctionCall },
}

impl ToolCall {
    pub fn id(&self) -> &str {
        match self {
            ToolCall::CodeInterpreter { id, .. }
            | ToolCall::Retrieval { id }
            | ToolCall::Function { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CodeInterpreterCall {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub outputs: Vec<CodeOutput>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeOutput {
    Logs { logs: String },
    Image { image: FileRef },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transcription {
    text: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("No se pudo construir el cliente HTTP de OpenAI")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            assistant_model: "gpt-4-turbo".to_string(),
            vision_model: "gpt-4o".to_string(),
            transcription_model: "whisper-1".to_string(),
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let mut client = Self::new(&cfg.openai_base_url, &cfg.openai_api_key)?;
        client.assistant_model = cfg.llm_chat_model.clone();
        client.vision_model = cfg.llm_vision_model.clone();
        client.transcription_model = cfg.llm_transcription_model.clone();
        Ok(client)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder, what: &str) -> Result<T> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Fallo de red en OpenAI ({what})"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("OpenAI respondió {status} en {what}: {body}"));
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("Respuesta inesperada de OpenAI ({what})"))
    }

    // ---------------------------------------------------------------------
    // FICHEROS
    // ---------------------------------------------------------------------

    /// Sube un fichero local con propósito `assistants`.
    pub async fn upload_file(&self, path: &Path) -> Result<FileObject> {
        let form = Form::new()
            .text("purpose", "assistants")
            .part("file", file_part(path).await?);
        let file: FileObject =
            Self::send(self.request(Method::POST, "files").multipart(form), "subida de fichero")
                .await?;
        debug!("Fichero {} subido como {}", path.display(), file.id);
        Ok(file)
    }

    pub async fn retrieve_file(&self, file_id: &str) -> Result<FileObject> {
        Self::send(
            self.request(Method::GET, &format!("files/{file_id}")),
            "consulta de fichero",
        )
        .await
    }

    // ---------------------------------------------------------------------
    // ASISTENTES
    // ---------------------------------------------------------------------

    pub async fn create_assistant(&self, name: &str, instructions: &str) -> Result<Assistant> {
        let body = json!({
            "name": name,
            "instructions": instructions,
            "tools": [FILE_SEARCH],
            "model": self.assistant_model,
        });
        Self::send(
            self.request(Method::POST, "assistants").json(&body),
            "creación de asistente",
        )
        .await
    }

    pub async fn retrieve_assistant(&self, assistant_id: &str) -> Result<Assistant> {
        Self::send(
            self.request(Method::GET, &format!("assistants/{assistant_id}")),
            "consulta de asistente",
        )
        .await
    }

    pub async fn update_assistant(
        &self,
        assistant_id: &str,
        update: &AssistantUpdate,
    ) -> Result<Assistant> {
        Self::send(
            self.request(Method::POST, &format!("assistants/{assistant_id}")).json(update),
            "actualización de asistente",
        )
        .await
    }

    // ---------------------------------------------------------------------
    // HILOS, MENSAJES Y RUNS
    // ---------------------------------------------------------------------

    pub async fn create_thread(&self) -> Result<Thread> {
        Self::send(
            self.request(Method::POST, "threads").json(&json!({})),
            "creación de hilo",
        )
        .await
    }

    /// Publica un mensaje de usuario; los ficheros quedan disponibles para la búsqueda.
    pub async fn create_message(
        &self,
        thread_id: &str,
        content: &str,
        file_ids: &[String],
    ) -> Result<Message> {
        let attachments: Vec<_> = file_ids
            .iter()
            .map(|id| json!({ "file_id": id, "tools": [FILE_SEARCH] }))
            .collect();
        let mut body = json!({ "role": "user", "content": content });
        if !attachments.is_empty() {
            body["attachments"] = json!(attachments);
        }
        Self::send(
            self.request(Method::POST, &format!("threads/{thread_id}/messages")).json(&body),
            "creación de mensaje",
        )
        .await
    }

    /// Mensajes del hilo, del más reciente al más antiguo.
    pub async fn list_messages(&self, thread_id: &str) -> Result<Vec<Message>> {
        let list: ListResponse<Message> = Self::send(
            self.request(Method::GET, &format!("threads/{thread_id}/messages"))
                .query(&[("order", "desc")]),
            "listado de mensajes",
        )
        .await?;
        Ok(list.data)
    }

    pub async fn retrieve_message(&self, thread_id: &str, message_id: &str) -> Result<Message> {
        Self::send(
            self.request(
                Method::GET,
                &format!("threads/{thread_id}/messages/{message_id}"),
            ),
            "consulta de mensaje",
        )
        .await
    }

    pub async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run> {
        Self::send(
            self.request(Method::POST, &format!("threads/{thread_id}/runs"))
                .json(&json!({ "assistant_id": assistant_id })),
            "creación de run",
        )
        .await
    }

    pub async fn retrieve_run(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        Self::send(
            self.request(Method::GET, &format!("threads/{thread_id}/runs/{run_id}")),
            "consulta de run",
        )
        .await
    }

    pub async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<Run> {
        Self::send(
            self.request(Method::POST, &format!("threads/{thread_id}/runs/{run_id}/cancel")),
            "cancelación de run",
        )
        .await
    }

    /// Pasos del run en orden cronológico.
    pub async fn list_run_steps(&self, thread_id: &str, run_id: &str) -> Result<Vec<RunStep>> {
        let list: ListResponse<RunStep> = Self::send(
            self.request(Method::GET, &format!("threads/{thread_id}/runs/{run_id}/steps"))
                .query(&[("order", "asc")]),
            "listado de pasos del run",
        )
        .await?;
        Ok(list.data)
    }

    pub async fn submit_tool_outputs(
        &self,
        thread_id: &str,
        run_id: &str,
        outputs: &[ToolOutput],
    ) -> Result<Run> {
        Self::send(
            self.request(
                Method::POST,
                &format!("threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
            )
            .json(&json!({ "tool_outputs": outputs })),
            "envío de resultados de herramientas",
        )
        .await
    }

    // ---------------------------------------------------------------------
    // VISIÓN Y TRANSCRIPCIÓN
    // ---------------------------------------------------------------------

    /// Envía una imagen local al modelo de visión junto con un prompt fijo.
    pub async fn describe_image(&self, prompt: &str, image: &Path, max_tokens: u32) -> Result<String> {
        let bytes = tokio::fs::read(image)
            .await
            .with_context(|| format!("No se pudo leer la imagen {}", image.display()))?;
        let mime = mime_guess::from_path(image).first_or(mime_guess::mime::IMAGE_JPEG);
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

        let body = json!({
            "model": self.vision_model,
            "max_tokens": max_tokens,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": format!("data:{mime};base64,{encoded}") } },
                ],
            }],
        });

        let completion: ChatCompletion = Self::send(
            self.request(Method::POST, "chat/completions").json(&body),
            "completado con visión",
        )
        .await?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("El modelo de visión no devolvió contenido"))
    }

    /// Transcribe un fichero de audio completo.
    pub async fn transcribe_file(&self, audio: &Path) -> Result<String> {
        let form = Form::new()
            .text("model", self.transcription_model.clone())
            .part("file", file_part(audio).await?);
        let transcription: Transcription = Self::send(
            self.request(Method::POST, "audio/transcriptions").multipart(form),
            "transcripción",
        )
        .await?;
        Ok(transcription.text)
    }
}

async fn file_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("No se pudo leer {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload.bin".to_string());
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime.as_ref())
        .context("Tipo MIME inválido para la subida")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> OpenAiClient {
        OpenAiClient::new(&format!("{}/v1/", server.uri()), "sk-test").expect("cliente")
    }

    #[test]
    fn decodes_tool_call_variants() {
        let calls: Vec<ToolCall> = serde_json::from_value(json!([
            {"id": "c1", "type": "code_interpreter",
             "code_interpreter": {"input": "print(1)", "outputs": [{"type": "logs", "logs": "1"}]}},
            {"id": "c2", "type": "retrieval", "retrieval": {}},
            {"id": "c3", "type": "file_search", "file_search": {}},
            {"id": "c4", "type": "function",
             "function": {"name": "lookup", "arguments": "{\"q\": 1}", "output": null}}
        ]))
        .expect("tool calls");

        assert!(matches!(&calls[0], ToolCall::CodeInterpreter { code_interpreter, .. }
            if code_interpreter.outputs == vec![CodeOutput::Logs { logs: "1".into() }]));
        assert_eq!(calls[1], ToolCall::Retrieval { id: "c2".into() });
        assert_eq!(calls[2].id(), "c3");
        assert!(matches!(&calls[3], ToolCall::Function { function, .. } if function.name == "lookup"));
    }

    #[test]
    fn unknown_payload_variants_do_not_fail_decoding() {
        let step: RunStep = serde_json::from_value(json!({
            "id": "step_1", "step_details": {"type": "something_new"}
        }))
        .expect("paso");
        assert!(matches!(step.step_details, StepDetails::Other));

        let run: Run = serde_json::from_value(json!({"id": "r", "status": "paused_by_vendor"}))
            .expect("run");
        assert_eq!(run.status, RunStatus::Unknown);
        assert!(!run.status.is_terminal());
    }

    #[test]
    fn run_status_classification() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::InProgress.is_terminal());
        assert!(!RunStatus::RequiresAction.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Expired.is_terminal());
    }

    #[tokio::test]
    async fn upload_sends_multipart_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/files"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"id": "file-1", "filename": "acta.txt"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("acta.txt");
        std::fs::write(&file, "contenido").expect("escribir");

        let client = client_for(&server).await;
        let uploaded = client.upload_file(&file).await.expect("subida");
        assert_eq!(uploaded.id, "file-1");
    }

    #[tokio::test]
    async fn message_attachments_are_sent_only_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/threads/t1/messages"))
            .and(body_partial_json(json!({
                "content": "Extract",
                "attachments": [{"file_id": "file-1", "tools": [{"type": "file_search"}]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1", "role": "user", "content": []
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let msg = client
            .create_message("t1", "Extract", &["file-1".to_string()])
            .await
            .expect("mensaje");
        assert_eq!(msg.id, "msg_1");
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/t1/messages"))
            .and(query_param("order", "desc"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let err = client.list_messages("t1").await.expect_err("debe fallar");
        let text = err.to_string();
        assert!(text.contains("429"), "{text}");
        assert!(text.contains("rate limited"), "{text}");
    }

    #[tokio::test]
    async fn vision_reply_content_is_returned() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "gpt-4o", "max_tokens": 500})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "{\"Metadata\": {}}"}}]
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("foto.png");
        std::fs::write(&image, [0x89, b'P', b'N', b'G']).expect("escribir");

        let client = client_for(&server).await;
        let reply = client.describe_image("describe", &image, 500).await.expect("visión");
        assert_eq!(reply, "{\"Metadata\": {}}");
    }
}
