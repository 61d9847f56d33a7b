//! Transcripción de audio largo: troceado en segmentos, transcripción
//! secuencial y limpieza de los ficheros intermedios.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::media::{AudioSegments, MediaConverter};
use crate::openai::OpenAiClient;

/// Servicio de voz a texto.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, audio: &Path) -> Result<String>;
}

#[async_trait]
impl SpeechToText for OpenAiClient {
    async fn transcribe(&self, audio: &Path) -> Result<String> {
        self.transcribe_file(audio).await
    }
}

#[derive(Clone)]
pub struct Transcriber {
    media: Arc<dyn MediaConverter>,
    stt: Arc<dyn SpeechToText>,
    chunk: Duration,
}

impl Transcriber {
    pub fn new(media: Arc<dyn MediaConverter>, stt: Arc<dyn SpeechToText>, chunk: Duration) -> Self {
        Self { media, stt, chunk }
    }

    /// Transcribe `audio` completo; los textos de cada segmento se unen con un espacio.
    ///
    /// Cualquier segmento fallido aborta la operación sin resultado parcial. Los
    /// segmentos se borran siempre; el original sólo tras un éxito y si
    /// `keep_original` es falso.
    pub async fn transcribe(&self, audio: &Path, keep_original: bool) -> Result<String> {
        let mut segments = AudioSegments::open(self.media.as_ref(), audio, self.chunk).await?;
        let total = segments.len();
        let mut parts = Vec::with_capacity(total);

        let mut index = 0;
        while let Some(segment) = segments.next().await {
            index += 1;
            let segment = segment.with_context(|| {
                format!("No se pudo cortar el segmento {index}/{total} de {}", audio.display())
            });
            let segment = match segment {
                Ok(path) => path,
                Err(err) => {
                    remove_quietly(&crate::media::segment_path(audio, index - 1)).await;
                    return Err(err);
                }
            };

            debug!("Transcribiendo segmento {index}/{total}: {}", segment.display());
            let text = self.stt.transcribe(&segment).await;
            remove_quietly(&segment).await;
            let text = text.with_context(|| {
                format!("Falló la transcripción del segmento {index}/{total} de {}", audio.display())
            })?;
            parts.push(text);
        }

        if !keep_original {
            tokio::fs::remove_file(audio)
                .await
                .with_context(|| format!("No se pudo borrar {}", audio.display()))?;
        }

        info!("Transcritos {total} segmentos de {}", audio.display());
        Ok(parts.join(" "))
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("No se pudo borrar {}: {err}", path.display()),
    }
}
