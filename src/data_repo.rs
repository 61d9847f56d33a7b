//! Repositorio local de ficheros ingeridos: `<raíz>/{Image,Text,Video,Audio}`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::info;
use url::Url;

use crate::models::DataType;
use crate::sanitize::sanitize_upload_name;

/// Fichero guardado en el repositorio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    /// Nombre base ya saneado, sin extensión.
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct DataRepo {
    root: PathBuf,
}

impl DataRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Crea la raíz y sus cuatro subcarpetas si faltan.
    pub async fn setup(&self) -> Result<()> {
        for kind in [DataType::Image, DataType::Text, DataType::Video, DataType::Audio] {
            let dir = self.dir(kind);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("No se pudo crear {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn dir(&self, kind: DataType) -> PathBuf {
        self.root.join(kind.folder())
    }

    fn target(&self, kind: DataType, original_name: &str) -> StoredFile {
        let (title, extension) = sanitize_upload_name(original_name);
        StoredFile {
            path: self.dir(kind).join(format!("{title}{extension}")),
            title,
        }
    }

    /// Guarda los bytes subidos con el nombre base saneado y la extensión original.
    pub async fn store_bytes(&self, kind: DataType, original_name: &str, bytes: &[u8]) -> Result<StoredFile> {
        let stored = self.target(kind, original_name);
        tokio::fs::write(&stored.path, bytes)
            .await
            .with_context(|| format!("No se pudo guardar {}", stored.path.display()))?;
        info!("Guardado {} en {}", original_name, stored.path.display());
        Ok(stored)
    }

    /// Copia un fichero local al repositorio.
    pub async fn store_copy(&self, kind: DataType, source: &Path) -> Result<StoredFile> {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Ruta sin nombre de fichero: {}", source.display()))?;
        let stored = self.target(kind, &name);
        tokio::fs::copy(source, &stored.path)
            .await
            .with_context(|| format!("No se pudo copiar {}", source.display()))?;
        info!("Copiado {} en {}", source.display(), stored.path.display());
        Ok(stored)
    }

    /// Descarga un vídeo accesible directamente por URL a la carpeta `Video`.
    pub async fn download_video(&self, http: &reqwest::Client, url: &Url) -> Result<StoredFile> {
        let name = url_file_name(url);
        let stored = self.target(DataType::Video, &name);

        let resp = http
            .get(url.as_str())
            .send()
            .await
            .with_context(|| format!("No se pudo descargar {url}"))?;
        if !resp.status().is_success() {
            return Err(anyhow!("La descarga de {url} falló con {}", resp.status()));
        }

        let mut file = tokio::fs::File::create(&stored.path)
            .await
            .with_context(|| format!("No se pudo crear {}", stored.path.display()))?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Descarga interrumpida de {url}"))?;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        info!("Descargado {url} en {}", stored.path.display());
        Ok(stored)
    }

    /// `Text/<title>_text.txt`
    pub fn transcript_path(&self, title: &str) -> PathBuf {
        self.dir(DataType::Text).join(format!("{title}_text.txt"))
    }

    /// Audio extraído de un vídeo: `Audio/<title>.wav`.
    pub fn extracted_audio_path(&self, title: &str) -> PathBuf {
        self.dir(DataType::Audio).join(format!("{title}.wav"))
    }

    /// Vídeo sintetizado a partir de un audio: `Video/<title>.mp4`.
    pub fn still_video_path(&self, title: &str) -> PathBuf {
        self.dir(DataType::Video).join(format!("{title}.mp4"))
    }

    pub async fn write_transcript(&self, title: &str, text: &str) -> Result<PathBuf> {
        let path = self.transcript_path(title);
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("No se pudo escribir {}", path.display()))?;
        info!("Transcripción guardada en {}", path.display());
        Ok(path)
    }
}

/// Nombre de fichero de una URL de vídeo; se asume `.mp4` si no trae extensión.
pub fn url_file_name(url: &Url) -> String {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("video");
    if Path::new(last).extension().is_some() {
        last.to_string()
    } else {
        format!("{last}.mp4")
    }
}
