//! Carga y gestión de configuración de la aplicación (Elasticsearch + OpenAI + VideoDB).
//!
//! Toda la configuración llega por variables de entorno y se lee una única vez
//! al arrancar; después se inyecta en cada componente.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub es_endpoint: String,
    pub es_api_key: String,
    pub assistant_index: String,
    pub document_index: String,

    pub openai_api_key: String,
    pub openai_base_url: String,
    pub llm_chat_model: String,
    pub llm_vision_model: String,
    pub llm_transcription_model: String,

    /// Asistente remoto que atiende las conversaciones.
    pub retrieval_assistant_id: String,
    pub doc_assistant_name: String,
    pub transcript_assistant_name: String,

    pub video_db_api_key: String,
    pub video_db_base_url: String,

    pub data_repo_dir: PathBuf,
    pub placeholder_image: PathBuf,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,

    pub metadata_poll_interval: Duration,
    pub agent_poll_interval: Duration,
    pub run_timeout: Duration,
    pub audio_chunk: Duration,
    /// Tamaño máximo de un formulario de subida.
    pub max_upload_bytes: usize,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Construye la configuración a partir de una función de búsqueda de claves.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("Falta {key} en el entorno"))
        };
        let or_default = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key).filter(|v| !v.trim().is_empty()) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("{key} debe ser un entero positivo, recibido '{raw}'")),
                None => Ok(default),
            }
        };

        let positive = |key: &str, default: u64| -> Result<u64> {
            match number(key, default)? {
                0 => Err(anyhow!("{key} debe ser mayor que cero")),
                value => Ok(value),
            }
        };

        let audio_chunk_secs = positive("AUDIO_CHUNK_MINUTES", 10)?
            .checked_mul(60)
            .ok_or_else(|| anyhow!("AUDIO_CHUNK_MINUTES fuera de rango"))?;
        let max_upload_bytes = positive("MAX_UPLOAD_MB", 1024)?
            .checked_mul(1024 * 1024)
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| anyhow!("MAX_UPLOAD_MB fuera de rango"))?;

        Ok(Self {
            server_addr: or_default("SERVER_ADDR", "127.0.0.1:3322"),

            es_endpoint: required("ES_END_POINT")?,
            es_api_key: required("ES_API_KEY")?,
            assistant_index: or_default("ASSISTANT_INDEX", "ikms-assistants"),
            document_index: or_default("DOCUMENT_INDEX", "meta-summary-registry"),

            openai_api_key: required("OPENAI_API_KEY")?,
            openai_base_url: or_default("OPENAI_BASE_URL", "https://api.openai.com/v1"),
            llm_chat_model: or_default("LLM_CHAT_MODEL", "gpt-4-turbo"),
            llm_vision_model: or_default("LLM_VISION_MODEL", "gpt-4o"),
            llm_transcription_model: or_default("LLM_TRANSCRIPTION_MODEL", "whisper-1"),

            retrieval_assistant_id: required("ASSISTANT_ID")?,
            doc_assistant_name: or_default("DOC_ASSISTANT_NAME", "Meta Doc Creator"),
            transcript_assistant_name: or_default(
                "TRANSCRIPT_ASSISTANT_NAME",
                "Meta Transcript Creator",
            ),

            video_db_api_key: required("VIDEO_DB_API_KEY")?,
            video_db_base_url: or_default("VIDEO_DB_BASE_URL", "https://api.videodb.io"),

            data_repo_dir: PathBuf::from(or_default("DATA_REPO_DIR", "IKMS Data Repo")),
            placeholder_image: PathBuf::from(or_default(
                "PLACEHOLDER_IMAGE",
                "assets/audio/audio_img.png",
            )),
            ffmpeg_bin: or_default("FFMPEG_BIN", "ffmpeg"),
            ffprobe_bin: or_default("FFPROBE_BIN", "ffprobe"),

            metadata_poll_interval: Duration::from_millis(positive("METADATA_POLL_INTERVAL_MS", 500)?),
            agent_poll_interval: Duration::from_millis(positive("AGENT_POLL_INTERVAL_MS", 2000)?),
            run_timeout: Duration::from_secs(positive("RUN_TIMEOUT_SECS", 600)?),
            audio_chunk: Duration::from_secs(audio_chunk_secs),
            max_upload_bytes,
        })
    }
}
