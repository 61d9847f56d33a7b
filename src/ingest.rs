//! Ingesta de ficheros subidos (imágenes, documentos, vídeo y audio): guardado
//! en el repositorio local, extracción de metadatos con el LLM e indexado en
//! la colección de documentos.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::{error, info, warn};
use url::Url;
use walkdir::WalkDir;

use crate::app_state::StatusHandle;
use crate::data_repo::{url_file_name, DataRepo, StoredFile};
use crate::document_store::DocumentSink;
use crate::extraction::MetadataSource;
use crate::media::MediaConverter;
use crate::models::{DataType, DocumentRecord};
use crate::transcribe::Transcriber;
use crate::video_host::VideoHost;

/// Origen del contenido de un elemento del lote.
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Vec<u8>),
    LocalPath(PathBuf),
    Url(Url),
}

/// Elemento de un lote de ingesta.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub kind: DataType,
    /// Nombre original tal como lo subió el usuario.
    pub name: String,
    pub source: UploadSource,
}

impl UploadItem {
    pub fn bytes(kind: DataType, name: &str, bytes: Vec<u8>) -> Self {
        Self {
            kind,
            name: name.to_string(),
            source: UploadSource::Bytes(bytes),
        }
    }

    pub fn local(kind: DataType, path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            kind,
            name,
            source: UploadSource::LocalPath(path.to_path_buf()),
        }
    }

    pub fn video_url(url: Url) -> Self {
        Self {
            kind: DataType::Video,
            name: url.to_string(),
            source: UploadSource::Url(url),
        }
    }

    /// Comprueba el tipo antes de cualquier llamada remota.
    pub fn validate(&self) -> Result<()> {
        let file_name = match &self.source {
            UploadSource::Url(url) => {
                if self.kind != DataType::Video {
                    return Err(anyhow!("Sólo se admiten URLs de vídeo"));
                }
                url_file_name(url)
            }
            _ => self.name.clone(),
        };
        if self.kind.accepts(&file_name) {
            Ok(())
        } else {
            Err(anyhow!(
                "Tipo de fichero no admitido para {}: '{}' (extensiones válidas: {})",
                self.kind,
                self.name,
                self.kind.allowed_extensions().join(", ")
            ))
        }
    }
}

/// Resumen de los resultados de una operación de ingesta.
#[derive(Debug, Default)]
pub struct IngestionSummary {
    /// (nombre, id en el índice)
    pub ingested: Vec<(String, String)>,
    /// (nombre, motivo)
    pub failed: Vec<(String, String)>,
    /// Ficheros de un directorio que no corresponden a ningún tipo admitido.
    pub skipped: Vec<String>,
}

/// Implementa cómo se mostrará el resumen como texto.
impl fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Resumen: {} ingeridos, {} con error, {} omitidos.",
            self.ingested.len(),
            self.failed.len(),
            self.skipped.len()
        )?;
        for (name, reason) in &self.failed {
            write!(f, "\n- {name}: {reason}")?;
        }
        Ok(())
    }
}

/// Nombres de los asistentes que resumen cada clase de contenido.
#[derive(Debug, Clone)]
pub struct AssistantNames {
    pub documents: String,
    pub transcripts: String,
}

/// Orquestador de la ingesta, con todas sus dependencias inyectadas.
pub struct Ingestor {
    repo: DataRepo,
    media: Arc<dyn MediaConverter>,
    transcriber: Transcriber,
    metadata: Arc<dyn MetadataSource>,
    video_host: Arc<dyn VideoHost>,
    sink: Arc<dyn DocumentSink>,
    http: reqwest::Client,
    placeholder_image: PathBuf,
    assistants: AssistantNames,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: DataRepo,
        media: Arc<dyn MediaConverter>,
        transcriber: Transcriber,
        metadata: Arc<dyn MetadataSource>,
        video_host: Arc<dyn VideoHost>,
        sink: Arc<dyn DocumentSink>,
        placeholder_image: PathBuf,
        assistants: AssistantNames,
    ) -> Self {
        Self {
            repo,
            media,
            transcriber,
            metadata,
            video_host,
            sink,
            http: reqwest::Client::new(),
            placeholder_image,
            assistants,
        }
    }

    /// Procesa los elementos en orden. El fallo de uno se registra una vez y
    /// el lote continúa con el siguiente.
    pub async fn ingest_batch(&self, items: Vec<UploadItem>, status: &StatusHandle) -> IngestionSummary {
        let mut summary = IngestionSummary::default();
        let total = items.len();

        for (index, item) in items.into_iter().enumerate() {
            let position = format!("[{}/{}]", index + 1, total);
            status.step(format!("{position} Procesando: {}...", item.name));

            match self.ingest_item(&item, status).await {
                Ok(id) => {
                    status.step(format!("{position} Indexado: {}", item.name));
                    summary.ingested.push((item.name, id));
                }
                Err(err) => {
                    error!("Error ingiriendo {}: {err:#}", item.name);
                    status.step(format!("{position} ERROR en {}: {err:#}", item.name));
                    summary.failed.push((item.name, format!("{err:#}")));
                }
            }
            status.set_progress((index + 1) as f32 / total as f32);
        }

        info!("{summary}");
        summary
    }

    /// Recorre un directorio local e ingiere los ficheros de tipos admitidos.
    pub async fn ingest_directory(&self, root: &Path, status: &StatusHandle) -> Result<IngestionSummary> {
        if !root.is_dir() {
            return Err(anyhow!("La ruta no es un directorio: {}", root.display()));
        }

        let mut items = Vec::new();
        let mut skipped = Vec::new();
        for entry in WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy();
            match DataType::classify(&name) {
                Some(kind) => items.push(UploadItem::local(kind, path)),
                None => {
                    warn!("Omitido {}: tipo no admitido", path.display());
                    skipped.push(path.display().to_string());
                }
            }
        }

        status.step(format!(
            "{} ficheros admitidos en {}, {} omitidos",
            items.len(),
            root.display(),
            skipped.len()
        ));
        let mut summary = self.ingest_batch(items, status).await;
        summary.skipped = skipped;
        Ok(summary)
    }

    /// Ingiere un elemento y devuelve el id del registro indexado.
    pub async fn ingest_item(&self, item: &UploadItem, status: &StatusHandle) -> Result<String> {
        item.validate()?;

        let record = match item.kind {
            DataType::Image => self.ingest_image(item).await?,
            DataType::Text => self.ingest_text(item).await?,
            DataType::Video => self.ingest_video(item, status).await?,
            DataType::Audio => self.ingest_audio(item, status).await?,
        };
        self.sink.index_document(&record).await
    }

    async fn store(&self, item: &UploadItem) -> Result<StoredFile> {
        match &item.source {
            UploadSource::Bytes(bytes) => self.repo.store_bytes(item.kind, &item.name, bytes).await,
            UploadSource::LocalPath(path) => self.repo.store_copy(item.kind, path).await,
            UploadSource::Url(url) => self.repo.download_video(&self.http, url).await,
        }
    }

    async fn ingest_image(&self, item: &UploadItem) -> Result<DocumentRecord> {
        let stored = self.store(item).await?;
        let summary = self.metadata.describe_image(&stored.path).await?;
        Ok(DocumentRecord::new(summary, &stored.path, &item.name, DataType::Image))
    }

    async fn ingest_text(&self, item: &UploadItem) -> Result<DocumentRecord> {
        let stored = self.store(item).await?;
        let summary = self
            .metadata
            .describe_file(&stored.path, &self.assistants.documents)
            .await?;
        Ok(DocumentRecord::new(summary, &stored.path, &item.name, DataType::Text))
    }

    async fn ingest_video(&self, item: &UploadItem, status: &StatusHandle) -> Result<DocumentRecord> {
        let stored = self.store(item).await?;

        status.step(format!("Extrayendo audio de {}...", item.name));
        let audio = self.repo.extracted_audio_path(&stored.title);
        self.media.extract_audio(&stored.path, &audio).await?;

        status.step(format!("Transcribiendo {}...", item.name));
        let text = self.transcriber.transcribe(&audio, false).await?;
        let transcript = self.repo.write_transcript(&stored.title, &text).await?;

        status.step(format!("Subiendo {} al alojamiento de vídeo...", item.name));
        let video_id = match &item.source {
            UploadSource::Url(url) => self.video_host.upload_url(url).await?,
            _ => self.video_host.upload_file(&stored.path).await?,
        };

        let summary = self
            .metadata
            .describe_file(&transcript, &self.assistants.transcripts)
            .await?;
        Ok(DocumentRecord::new(summary, &transcript, &item.name, DataType::Video)
            .with_media(&stored.path, video_id))
    }

    async fn ingest_audio(&self, item: &UploadItem, status: &StatusHandle) -> Result<DocumentRecord> {
        let stored = self.store(item).await?;

        status.step(format!("Generando vídeo para {}...", item.name));
        let video = self.repo.still_video_path(&stored.title);
        self.media
            .synthesize_still_video(&self.placeholder_image, &stored.path, &video)
            .await?;
        let uploaded = self.video_host.upload_file(&video).await;
        if let Err(err) = tokio::fs::remove_file(&video).await {
            warn!("No se pudo borrar el vídeo temporal {}: {err}", video.display());
        }
        let video_id = uploaded?;

        status.step(format!("Transcribiendo {}...", item.name));
        let text = self.transcriber.transcribe(&stored.path, true).await?;
        let transcript = self.repo.write_transcript(&stored.title, &text).await?;

        let summary = self
            .metadata
            .describe_file(&transcript, &self.assistants.transcripts)
            .await?;
        Ok(DocumentRecord::new(summary, &transcript, &item.name, DataType::Audio)
            .with_media(&stored.path, video_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentSummary;
    use crate::transcribe::SpeechToText;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeMedia {
        duration: Duration,
    }

    #[async_trait]
    impl MediaConverter for FakeMedia {
        async fn probe_duration(&self, _media: &Path) -> Result<Duration> {
            Ok(self.duration)
        }
        async fn extract_audio(&self, _video: &Path, output: &Path) -> Result<()> {
            tokio::fs::write(output, b"wav").await?;
            Ok(())
        }
        async fn cut_segment(&self, _a: &Path, _s: Duration, _l: Duration, output: &Path) -> Result<()> {
            tokio::fs::write(output, b"mp3").await?;
            Ok(())
        }
        async fn synthesize_still_video(&self, _i: &Path, _a: &Path, output: &Path) -> Result<()> {
            tokio::fs::write(output, b"mp4").await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingStt {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechToText for CountingStt {
        async fn transcribe(&self, _audio: &Path) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("trozo{n}"))
        }
    }

    #[derive(Default)]
    struct FakeMetadata {
        calls: Mutex<Vec<(PathBuf, Option<String>)>>,
    }

    #[async_trait]
    impl MetadataSource for FakeMetadata {
        async fn describe_file(&self, path: &Path, assistant_name: &str) -> Result<DocumentSummary> {
            self.calls
                .lock()
                .expect("lock")
                .push((path.to_path_buf(), Some(assistant_name.to_string())));
            if path.file_name().is_some_and(|n| n.to_string_lossy().starts_with("roto")) {
                return Err(anyhow!("el asistente no devolvió JSON"));
            }
            summary()
        }
        async fn describe_image(&self, path: &Path) -> Result<DocumentSummary> {
            self.calls.lock().expect("lock").push((path.to_path_buf(), None));
            summary()
        }
    }

    fn summary() -> Result<DocumentSummary> {
        Ok(serde_json::from_value(json!({
            "Metadata": {"DOC_Keywords": ["k"], "Domain": "Training"}
        }))?)
    }

    #[derive(Default)]
    struct FakeHost {
        uploads: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl VideoHost for FakeHost {
        async fn upload_file(&self, path: &Path) -> Result<String> {
            assert!(path.exists(), "el vídeo debe existir al subirlo");
            let mut uploads = self.uploads.lock().expect("lock");
            uploads.push(path.to_path_buf());
            Ok(format!("m-{}", uploads.len()))
        }
        async fn upload_url(&self, _url: &Url) -> Result<String> {
            Ok("m-url".into())
        }
    }

    #[derive(Default)]
    struct MemorySink {
        records: Mutex<Vec<DocumentRecord>>,
    }

    #[async_trait]
    impl DocumentSink for MemorySink {
        async fn index_document(&self, record: &DocumentRecord) -> Result<String> {
            let mut records = self.records.lock().expect("lock");
            records.push(record.clone());
            Ok(format!("doc-{}", records.len()))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        ingestor: Ingestor,
        stt: Arc<CountingStt>,
        metadata: Arc<FakeMetadata>,
        host: Arc<FakeHost>,
        sink: Arc<MemorySink>,
    }

    async fn harness(audio_minutes: u64) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("IKMS Data Repo");
        let repo = DataRepo::new(&root);
        repo.setup().await.expect("setup");

        let media: Arc<dyn MediaConverter> = Arc::new(FakeMedia {
            duration: Duration::from_secs(audio_minutes * 60),
        });
        let stt = Arc::new(CountingStt::default());
        let metadata = Arc::new(FakeMetadata::default());
        let host = Arc::new(FakeHost::default());
        let sink = Arc::new(MemorySink::default());

        let ingestor = Ingestor::new(
            repo,
            media.clone(),
            Transcriber::new(media, stt.clone(), Duration::from_secs(600)),
            metadata.clone(),
            host.clone(),
            sink.clone(),
            dir.path().join("audio_img.png"),
            AssistantNames {
                documents: "Meta Doc Creator".into(),
                transcripts: "Meta Transcript Creator".into(),
            },
        );
        Harness { _dir: dir, root, ingestor, stt, metadata, host, sink }
    }

    #[tokio::test]
    async fn failing_item_is_reported_once_and_batch_continues() {
        let h = harness(1).await;
        let status = StatusHandle::new("");
        let items = vec![
            UploadItem::bytes(DataType::Text, "uno.txt", b"a".to_vec()),
            UploadItem::bytes(DataType::Text, "roto.pdf", b"b".to_vec()),
            UploadItem::bytes(DataType::Text, "tres.docx", b"c".to_vec()),
        ];

        let summary = h.ingestor.ingest_batch(items, &status).await;

        assert_eq!(summary.ingested.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "roto.pdf");
        let log = status.snapshot().log;
        assert_eq!(log.iter().filter(|l| l.contains("ERROR en roto.pdf")).count(), 1);
        assert_eq!(status.snapshot().progress, 1.0);

        let records = h.sink.records.lock().expect("lock");
        assert_eq!(records[0].name, "uno.txt");
        assert_eq!(records[1].name, "tres.docx");
        assert!(records.iter().all(|r| r.data_type == DataType::Text));
        let calls = h.metadata.calls.lock().expect("lock");
        assert!(calls.iter().all(|(_, a)| a.as_deref() == Some("Meta Doc Creator")));
    }

    #[tokio::test]
    async fn long_audio_is_chunked_and_linked_to_its_video() {
        let h = harness(25).await;
        let status = StatusHandle::new("");
        let item = UploadItem::bytes(DataType::Audio, "Team Sync.mp3", b"mp3".to_vec());

        let summary = h.ingestor.ingest_batch(vec![item], &status).await;
        assert!(summary.failed.is_empty(), "{summary}");

        assert_eq!(h.stt.calls.load(Ordering::SeqCst), 3);
        let uploads = h.host.uploads.lock().expect("lock");
        assert_eq!(uploads.len(), 1);
        assert!(!uploads[0].exists(), "el vídeo temporal debe borrarse");

        let records = h.sink.records.lock().expect("lock");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.data_type, DataType::Audio);
        assert_eq!(record.name, "Team Sync.mp3");
        assert_eq!(record.video_id.as_deref(), Some("m-1"));
        let audio = h.root.join("Audio").join("Team_Sync.mp3");
        assert_eq!(record.audio_source.as_deref(), Some(audio.to_string_lossy().as_ref()));
        assert!(audio.exists(), "el audio original se conserva");

        let transcript = h.root.join("Text").join("Team_Sync_text.txt");
        assert_eq!(record.source, transcript.to_string_lossy());
        assert_eq!(
            std::fs::read_to_string(&transcript).expect("transcripción"),
            "trozo1 trozo2 trozo3"
        );
        let calls = h.metadata.calls.lock().expect("lock");
        assert_eq!(calls[0].1.as_deref(), Some("Meta Transcript Creator"));
    }

    #[tokio::test]
    async fn video_upload_is_transcribed_and_hosted() {
        let h = harness(4).await;
        let status = StatusHandle::new("");
        let item = UploadItem::bytes(DataType::Video, "demo.mov", b"mov".to_vec());

        let id = h.ingestor.ingest_item(&item, &status).await.expect("ingesta");
        assert_eq!(id, "doc-1");

        let records = h.sink.records.lock().expect("lock");
        let record = &records[0];
        let video = h.root.join("Video").join("demo.mov");
        assert_eq!(record.video_source.as_deref(), Some(video.to_string_lossy().as_ref()));
        assert_eq!(record.video_id.as_deref(), Some("m-1"));
        assert!(!h.root.join("Audio").join("demo.wav").exists(), "el audio extraído se borra");
        assert!(h.root.join("Text").join("demo_text.txt").exists());
    }

    #[tokio::test]
    async fn unsupported_type_is_rejected_before_remote_calls() {
        let h = harness(1).await;
        let status = StatusHandle::new("");
        let items = vec![
            UploadItem::bytes(DataType::Image, "animado.gif", b"gif".to_vec()),
            UploadItem::bytes(DataType::Audio, "voz.ogg", b"ogg".to_vec()),
        ];

        let summary = h.ingestor.ingest_batch(items, &status).await;
        assert_eq!(summary.failed.len(), 2);
        assert!(summary.failed[0].1.contains("png, jpg, jpeg"));
        assert!(h.metadata.calls.lock().expect("lock").is_empty());
        assert!(h.host.uploads.lock().expect("lock").is_empty());
        assert!(!h.root.join("Image").join("animado.gif").exists());
    }

    #[tokio::test]
    async fn directory_ingestion_classifies_by_extension() {
        let h = harness(1).await;
        let source = tempfile::tempdir().expect("tempdir");
        std::fs::write(source.path().join("acta.txt"), "texto").expect("escribir");
        std::fs::write(source.path().join("foto.png"), [0x89, b'P']).expect("escribir");
        std::fs::write(source.path().join("script.sh"), "echo").expect("escribir");

        let status = StatusHandle::new("");
        let summary = h
            .ingestor
            .ingest_directory(source.path(), &status)
            .await
            .expect("directorio");

        assert_eq!(summary.ingested.len(), 2);
        assert_eq!(summary.skipped.len(), 1);
        assert!(summary.skipped[0].ends_with("script.sh"));
        let records = h.sink.records.lock().expect("lock");
        assert_eq!(records[0].data_type, DataType::Text);
        assert_eq!(records[1].data_type, DataType::Image);
        assert!(h.root.join("Image").join("foto.png").exists());
    }

    #[test]
    fn summary_lists_failures() {
        let summary = IngestionSummary {
            ingested: vec![("a.txt".into(), "1".into())],
            failed: vec![("b.pdf".into(), "sin JSON".into())],
            skipped: vec![],
        };
        assert_eq!(
            summary.to_string(),
            "Resumen: 1 ingeridos, 1 con error, 0 omitidos.\n- b.pdf: sin JSON"
        );
    }
}
