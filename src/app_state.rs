use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::config::AppConfig;
use crate::data_repo::DataRepo;
use crate::es_client::SearchClient;
use crate::extraction::MetadataExtractor;
use crate::ingest::{AssistantNames, Ingestor};
use crate::llm::LlmManager;
use crate::media::{FfmpegConverter, MediaConverter};
use crate::openai::OpenAiClient;
use crate::poll::{CancelHandle, PollSettings};
use crate::rag::{ChatSession, RetrievalAgent};
use crate::transcribe::Transcriber;
use crate::video_host::VideoDbClient;

/// Pasos recientes que se conservan en el estado.
const STATUS_LOG_LEN: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub search: Arc<SearchClient>,
    pub openai: Arc<OpenAiClient>,
    pub ingestor: Arc<Ingestor>,
    pub agent: Arc<RetrievalAgent>,
    pub status: StatusHandle,
    pub sessions: Arc<tokio::sync::Mutex<HashMap<String, SessionSlot>>>,
    pub shutdown_sender: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl AppState {
    /// Construye los clientes externos (uno por proceso) y los componentes
    /// de ingesta y chat a partir de la configuración.
    pub fn from_config(
        cfg: AppConfig,
        repo: DataRepo,
        shutdown_sender: oneshot::Sender<()>,
    ) -> Result<Self> {
        let openai = Arc::new(OpenAiClient::from_config(&cfg)?);
        let search = Arc::new(SearchClient::from_config(&cfg)?);
        let video_host = Arc::new(VideoDbClient::from_config(&cfg)?);
        let media: Arc<dyn MediaConverter> = Arc::new(FfmpegConverter::from_config(&cfg));
        let llm_manager =
            Arc::new(LlmManager::from_config(&cfg).context("Error inicializando LLM Manager")?);

        let metadata_poll = PollSettings::new(cfg.metadata_poll_interval, cfg.run_timeout);
        let agent_poll = PollSettings::new(cfg.agent_poll_interval, cfg.run_timeout);

        let ingestor = Ingestor::new(
            repo,
            media.clone(),
            Transcriber::new(media, openai.clone(), cfg.audio_chunk),
            Arc::new(MetadataExtractor::new(openai.clone(), search.clone(), metadata_poll)),
            video_host,
            search.clone(),
            cfg.placeholder_image.clone(),
            AssistantNames {
                documents: cfg.doc_assistant_name.clone(),
                transcripts: cfg.transcript_assistant_name.clone(),
            },
        );
        let agent = RetrievalAgent::new(
            openai.clone(),
            search.clone(),
            llm_manager,
            &cfg.retrieval_assistant_id,
            agent_poll,
        );

        Ok(Self {
            config: cfg,
            search,
            openai,
            ingestor: Arc::new(ingestor),
            agent: Arc::new(agent),
            status: StatusHandle::new("Servidor listo."),
            sessions: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_sender))),
        })
    }
}

/// Sesión de chat y, si hay un turno en curso, su disparador de cancelación.
pub struct SessionSlot {
    pub session: ChatSession,
    pub cancel: Option<CancelHandle>,
}

impl SessionSlot {
    pub fn new(session: ChatSession) -> Self {
        Self {
            session,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Status {
    pub is_busy: bool,
    pub message: String,
    pub progress: f32, // Valor entre 0.0 y 1.0
    pub log: VecDeque<String>,
}

impl Status {
    fn push_log(&mut self, message: String) {
        if self.log.len() == STATUS_LOG_LEN {
            self.log.pop_front();
        }
        self.log.push_back(message.clone());
        self.message = message;
    }
}

/// Estado de la ingesta compartido entre el lote en curso y la API.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle(Arc<Mutex<Status>>);

impl StatusHandle {
    pub fn new(message: &str) -> Self {
        Self(Arc::new(Mutex::new(Status {
            message: message.to_string(),
            ..Status::default()
        })))
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Marca el inicio de un lote; devuelve `false` si ya había uno en marcha.
    pub fn try_begin(&self, message: &str) -> bool {
        let mut status = self.lock();
        if status.is_busy {
            return false;
        }
        status.is_busy = true;
        status.progress = 0.0;
        status.log.clear();
        status.message = message.to_string();
        true
    }

    /// Registra un paso del lote.
    pub fn step(&self, message: impl Into<String>) {
        let message = message.into();
        let mut status = self.lock();
        status.push_log(message);
    }

    pub fn set_progress(&self, progress: f32) {
        self.lock().progress = progress.clamp(0.0, 1.0);
    }

    pub fn finish(&self, message: impl Into<String>) {
        let message = message.into();
        let mut status = self.lock();
        status.is_busy = false;
        status.progress = 0.0;
        status.push_log(message);
    }

    pub fn snapshot(&self) -> Status {
        self.lock().clone()
    }
}
