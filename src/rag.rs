//! Agente conversacional de recuperación.
//!
//! Flujo de un turno:
//!   1. (modos `rag` / `new_rag`) El LLM elige keywords y dominios de entre los
//!      que existen en el índice; se filtran los documentos con ellos.
//!   2. Se suben los ficheros preseleccionados y los adjuntos del usuario.
//!   3. Se lanza el asistente de recuperación sobre el hilo de la sesión.
//!   4. Se consulta el run cada pocos segundos y se emiten eventos cuando
//!      cambian sus mensajes o sus llamadas a herramientas.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::es_client::SearchClient;
use crate::extraction::{cited_file_names, render_reply};
use crate::llm::TermSelector;
use crate::models::FileSources;
use crate::openai::{
    AssistantUpdate, CodeOutput, MessageContent, OpenAiClient, RunStatus, RunStep, StepDetails,
    ToolCall, ToolOutput, FILE_SEARCH,
};
use crate::poll::{poll_until, CancelSignal, PollError, PollSettings};

/// Tipos MIME admitidos como adjuntos del usuario.
pub const ATTACHMENT_MIME_TYPES: &[&str] = &["text/csv", "application/pdf"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    /// Primer turno con recuperación de documentos.
    Rag,
    /// Turno sin recuperación.
    Normal,
    /// Sigue en el hilo sin tocar la configuración del asistente.
    Continue,
    /// Nueva recuperación dentro de una conversación ya empezada.
    NewRag,
}

impl ChatMode {
    pub fn uses_retrieval(self) -> bool {
        matches!(self, ChatMode::Rag | ChatMode::NewRag)
    }
}

/// Conversación con el asistente de recuperación: un hilo remoto por sesión.
#[derive(Debug, Clone, Serialize)]
pub struct ChatSession {
    pub id: String,
    pub thread_id: String,
    pub turns: usize,
}

impl ChatSession {
    pub fn new(thread_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id,
            turns: 0,
        }
    }

    /// El primer turno admite `rag` o `normal`; los siguientes `continue`,
    /// `normal` o `new_rag`.
    pub fn check_mode(&self, mode: ChatMode) -> Result<()> {
        let valid = if self.turns == 0 {
            matches!(mode, ChatMode::Rag | ChatMode::Normal)
        } else {
            matches!(mode, ChatMode::Continue | ChatMode::Normal | ChatMode::NewRag)
        };
        if valid {
            Ok(())
        } else {
            Err(anyhow!(
                "Modo {mode:?} no válido en el turno {} de la sesión {}",
                self.turns + 1,
                self.id
            ))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnRequest {
    pub message: String,
    pub mode: ChatMode,
    #[serde(default)]
    pub attachments: Vec<PathBuf>,
}

/// Comprueba por la extensión que el adjunto es CSV o PDF.
pub fn check_attachment(path: &Path) -> Result<()> {
    let mime = mime_guess::from_path(path).first_raw();
    match mime {
        Some(mime) if ATTACHMENT_MIME_TYPES.contains(&mime) => Ok(()),
        _ => Err(anyhow!(
            "Adjunto no admitido: {} (sólo {})",
            path.display(),
            ATTACHMENT_MIME_TYPES.join(", ")
        )),
    }
}

/// Eventos que se emiten durante un turno.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Selection {
        keywords: Vec<String>,
        domains: Vec<String>,
    },
    Sources {
        sources: FileSources,
    },
    Message {
        id: String,
        role: String,
        text: String,
    },
    ToolCall {
        id: String,
        tool: String,
        input: String,
        output: String,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    },
    RunFinished {
        status: RunStatus,
    },
    Error {
        message: String,
    },
}

fn timestamp(secs: Option<i64>) -> Option<DateTime<Utc>> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
}

/// Evento de una llamada a herramienta dentro de un paso del run.
pub fn tool_call_event(call: &ToolCall, step: &RunStep) -> AgentEvent {
    let (tool, input, output) = match call {
        ToolCall::CodeInterpreter {
            code_interpreter, ..
        } => {
            let output = code_interpreter
                .outputs
                .iter()
                .filter_map(|o| match o {
                    CodeOutput::Logs { logs } => Some(logs.clone()),
                    CodeOutput::Image { image } => Some(format!("[imagen {}]", image.file_id)),
                    CodeOutput::Other => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            ("code_interpreter".to_string(), code_interpreter.input.clone(), output)
        }
        ToolCall::Retrieval { .. } => ("file_search".to_string(), String::new(), String::new()),
        ToolCall::Function { function, .. } => (
            function.name.clone(),
            function.arguments.clone(),
            function.output.clone().unwrap_or_default(),
        ),
    };
    AgentEvent::ToolCall {
        id: call.id().to_string(),
        tool,
        input,
        output,
        started_at: timestamp(step.created_at),
        completed_at: timestamp(step.completed_at),
    }
}

/// Resultado que se entrega al run para una herramienta pedida.
pub fn tool_output(call: &ToolCall) -> ToolOutput {
    let output = match call {
        ToolCall::CodeInterpreter {
            code_interpreter, ..
        } => code_interpreter
            .outputs
            .iter()
            .filter_map(|o| match o {
                CodeOutput::Logs { logs } => Some(logs.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        ToolCall::Retrieval { .. } => String::new(),
        ToolCall::Function { function, .. } => json!({
            "error": format!("La función '{}' no está disponible", function.name)
        })
        .to_string(),
    };
    ToolOutput {
        tool_call_id: call.id().to_string(),
        output,
    }
}

/// Lo ya emitido y enviado durante un run, para no repetirlo en cada consulta.
#[derive(Debug, Default)]
struct RunTracker {
    messages: HashMap<String, String>,
    tool_calls: HashMap<String, AgentEvent>,
    submitted: HashSet<String>,
}

impl RunTracker {
    fn message_changed(&mut self, id: &str, raw: &str) -> bool {
        if self.messages.get(id).is_some_and(|prev| prev == raw) {
            return false;
        }
        self.messages.insert(id.to_string(), raw.to_string());
        true
    }

    fn tool_call_changed(&mut self, id: &str, event: &AgentEvent) -> bool {
        if self.tool_calls.get(id) == Some(event) {
            return false;
        }
        self.tool_calls.insert(id.to_string(), event.clone());
        true
    }

    /// Devuelve las llamadas que aún no tienen resultado enviado.
    fn take_unsubmitted(&mut self, calls: &[ToolCall]) -> Vec<ToolCall> {
        calls
            .iter()
            .filter(|c| self.submitted.insert(c.id().to_string()))
            .cloned()
            .collect()
    }
}

fn lock(tracker: &Mutex<RunTracker>) -> MutexGuard<'_, RunTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn emit(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) {
    if events.send(event).await.is_err() {
        debug!("El receptor de eventos ya no escucha");
    }
}

pub struct RetrievalAgent {
    openai: Arc<OpenAiClient>,
    search: Arc<SearchClient>,
    selector: Arc<dyn TermSelector>,
    assistant_id: String,
    poll: PollSettings,
}

impl RetrievalAgent {
    pub fn new(
        openai: Arc<OpenAiClient>,
        search: Arc<SearchClient>,
        selector: Arc<dyn TermSelector>,
        assistant_id: &str,
        poll: PollSettings,
    ) -> Self {
        Self {
            openai,
            search,
            selector,
            assistant_id: assistant_id.to_string(),
            poll,
        }
    }

    /// Abre una sesión nueva con su propio hilo.
    pub async fn start_session(&self) -> Result<ChatSession> {
        let thread = self.openai.create_thread().await?;
        let session = ChatSession::new(thread.id);
        info!("Sesión {} abierta sobre el hilo {}", session.id, session.thread_id);
        Ok(session)
    }

    /// Ejecuta un turno completo y devuelve el estado final del run.
    pub async fn run_turn(
        &self,
        session: &mut ChatSession,
        request: TurnRequest,
        events: &mpsc::Sender<AgentEvent>,
        cancel: CancelSignal,
    ) -> Result<RunStatus> {
        session.check_mode(request.mode)?;
        for attachment in &request.attachments {
            check_attachment(attachment)?;
        }

        let mut file_ids = Vec::new();
        if request.mode.uses_retrieval() {
            file_ids.extend(self.retrieve_files(&request.message, events).await?);
        }
        for attachment in &request.attachments {
            let file = self.openai.upload_file(attachment).await?;
            file_ids.push(file.id);
        }

        if request.mode != ChatMode::Continue {
            self.apply_assistant_config().await?;
        }

        let thread_id = session.thread_id.as_str();
        self.openai
            .create_message(thread_id, &request.message, &file_ids)
            .await?;
        session.turns += 1;
        let run = self.openai.create_run(thread_id, &self.assistant_id).await?;
        info!(
            "Turno {} de la sesión {} ({:?}, {} ficheros): run {}",
            session.turns,
            session.id,
            request.mode,
            file_ids.len(),
            run.id
        );

        let status = match self.follow_run(thread_id, &run.id, events, &cancel).await {
            Ok(status) => status,
            Err(PollError::Cancelled) => {
                warn!("Turno cancelado; cancelando run {}", run.id);
                self.openai.cancel_run(thread_id, &run.id).await?;
                RunStatus::Cancelled
            }
            Err(err) => return Err(err).with_context(|| format!("Siguiendo el run {}", run.id)),
        };

        emit(events, AgentEvent::RunFinished { status }).await;
        Ok(status)
    }

    /// Selecciona términos, filtra documentos y sube sus ficheros.
    async fn retrieve_files(&self, question: &str, events: &mpsc::Sender<AgentEvent>) -> Result<Vec<String>> {
        let keywords = self.search.unique_keywords().await?;
        let domains = self.search.unique_domains().await?;
        let selection = self
            .selector
            .select_terms(question, &keywords, &domains)
            .await?;
        emit(
            events,
            AgentEvent::Selection {
                keywords: selection.keywords.clone(),
                domains: selection.domains.clone(),
            },
        )
        .await;

        let documents = self.search.filter_documents(&selection.into_filter()).await?;
        emit(
            events,
            AgentEvent::Sources {
                sources: FileSources::from_documents(&documents),
            },
        )
        .await;

        let sources: BTreeSet<&str> = documents
            .iter()
            .map(|d| d.record.source.as_str())
            .filter(|s| !s.is_empty())
            .collect();
        let mut file_ids = Vec::with_capacity(sources.len());
        for source in sources {
            match self.openai.upload_file(Path::new(source)).await {
                Ok(file) => file_ids.push(file.id),
                Err(err) => warn!("No se pudo subir {source}: {err:#}"),
            }
        }
        info!("{} documentos recuperados, {} ficheros subidos", documents.len(), file_ids.len());
        Ok(file_ids)
    }

    /// Reaplica al asistente sus propias instrucciones con la búsqueda de ficheros.
    async fn apply_assistant_config(&self) -> Result<()> {
        let assistant = self.openai.retrieve_assistant(&self.assistant_id).await?;
        self.openai
            .update_assistant(
                &self.assistant_id,
                &AssistantUpdate {
                    name: assistant.name,
                    instructions: assistant.instructions,
                    model: Some(assistant.model).filter(|m| !m.is_empty()),
                    tools: vec![FILE_SEARCH],
                },
            )
            .await?;
        Ok(())
    }

    async fn follow_run(
        &self,
        thread_id: &str,
        run_id: &str,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancelSignal,
    ) -> Result<RunStatus, PollError> {
        let openai = self.openai.as_ref();
        let tracker = Mutex::new(RunTracker::default());
        let tracker = &tracker;

        poll_until(self.poll, cancel, move || async move {
            let run = openai.retrieve_run(thread_id, run_id).await?;
            let steps = openai.list_run_steps(thread_id, run_id).await?;

            for step in &steps {
                match &step.step_details {
                    StepDetails::MessageCreation { message_creation } => {
                        let message = openai
                            .retrieve_message(thread_id, &message_creation.message_id)
                            .await?;
                        let raw: String = message
                            .content
                            .iter()
                            .filter_map(|c| match c {
                                MessageContent::Text { text } => Some(text.value.as_str()),
                                _ => None,
                            })
                            .collect();
                        let changed = lock(tracker).message_changed(&message.id, &raw);
                        if changed {
                            let names = cited_file_names(openai, &message).await;
                            let text = render_reply(&message, &names);
                            emit(
                                events,
                                AgentEvent::Message {
                                    id: message.id.clone(),
                                    role: message.role.clone(),
                                    text,
                                },
                            )
                            .await;
                        }
                    }
                    StepDetails::ToolCalls { tool_calls } => {
                        for call in tool_calls {
                            let event = tool_call_event(call, step);
                            let changed = lock(tracker).tool_call_changed(call.id(), &event);
                            if changed {
                                emit(events, event).await;
                            }
                        }
                    }
                    StepDetails::Other => {}
                }
            }

            if run.status == RunStatus::RequiresAction {
                let calls = run
                    .required_action
                    .and_then(|a| a.submit_tool_outputs)
                    .map(|s| s.tool_calls)
                    .unwrap_or_default();
                let pending = lock(tracker).take_unsubmitted(&calls);
                if !pending.is_empty() {
                    let outputs: Vec<ToolOutput> = pending.iter().map(tool_output).collect();
                    debug!("Enviando {} resultados de herramientas al run {run_id}", outputs.len());
                    openai.submit_tool_outputs(thread_id, run_id, &outputs).await?;
                }
                return Ok(None);
            }

            debug!("Run {run_id} en estado {:?}", run.status);
            Ok(run.status.is_terminal().then_some(run.status))
        })
        .await
    }
}
