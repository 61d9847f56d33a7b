//! Modelos de dominio: configuración de asistentes, registros de metadatos de
//! documentos indexados y tipos de medio admitidos.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Documento de la colección de asistentes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantConfig {
    /// Id del documento en el índice (no forma parte del `_source`).
    #[serde(skip)]
    pub id: String,
    pub assistant_id: String,
    pub assistant_name: String,
    #[serde(rename = "Prompt", default)]
    pub prompt: String,
}

/// Tipo de dato de un documento ingerido.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DataType {
    Text,
    Image,
    Video,
    Audio,
}

impl DataType {
    /// Extensiones admitidas para cada tipo de subida.
    pub fn allowed_extensions(self) -> &'static [&'static str] {
        match self {
            DataType::Image => &["png", "jpg", "jpeg"],
            DataType::Text => &["txt", "pdf", "docx"],
            DataType::Video => &["mp4", "mov", "avi"],
            DataType::Audio => &["mp3", "wav"],
        }
    }

    pub fn accepts(self, file_name: &str) -> bool {
        extension_of(file_name)
            .is_some_and(|ext| self.allowed_extensions().contains(&ext.as_str()))
    }

    /// Clasifica un fichero por su extensión.
    pub fn classify(file_name: &str) -> Option<Self> {
        [DataType::Image, DataType::Text, DataType::Video, DataType::Audio]
            .into_iter()
            .find(|kind| kind.accepts(file_name))
    }

    /// Subcarpeta del repositorio de datos.
    pub fn folder(self) -> &'static str {
        match self {
            DataType::Text => "Text",
            DataType::Image => "Image",
            DataType::Video => "Video",
            DataType::Audio => "Audio",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "text" | "document" | "documents" => Some(DataType::Text),
            "image" | "images" => Some(DataType::Image),
            "video" | "videos" => Some(DataType::Video),
            "audio" | "audios" => Some(DataType::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.folder())
    }
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

/// Calificación de seguridad asignada por el modelo.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Security {
    Low,
    Medium,
    High,
}

impl<'de> Deserialize<'de> for Security {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_lowercase().as_str() {
            "low" => Ok(Security::Low),
            "medium" => Ok(Security::Medium),
            "high" => Ok(Security::High),
            other => Err(serde::de::Error::custom(format!(
                "nivel de seguridad desconocido: '{other}'"
            ))),
        }
    }
}

/// Complejidad ordinal en la escala 1–10.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Complexity(u8);

impl Complexity {
    pub fn new(value: i64) -> Self {
        Self(value.clamp(1, 10) as u8)
    }
}

impl<'de> Deserialize<'de> for Complexity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // El modelo la devuelve a veces como número y a veces como cadena.
        let raw = Value::deserialize(deserializer)?;
        let number = match &raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        match number {
            Some(n) if n.is_finite() => Ok(Complexity::new(n.round() as i64)),
            _ => Err(serde::de::Error::custom(format!(
                "complejidad no numérica: {raw}"
            ))),
        }
    }
}

/// Sección de un documento resumido.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Section {
    #[serde(rename = "Title", alias = "title", default)]
    pub title: String,
    #[serde(rename = "Description", alias = "description", default)]
    pub description: String,
    #[serde(rename = "Keywords", alias = "keywords", default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentDescription {
    #[serde(rename = "Description", default)]
    pub description: String,
    #[serde(rename = "Sections", default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<Section>,
}

/// Bloque `Metadata` del registro; es el que se consulta en la recuperación.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataBlock {
    #[serde(rename = "DOC_Keywords", default)]
    pub keywords: BTreeSet<String>,
    #[serde(rename = "Author", default)]
    pub author: String,
    #[serde(rename = "Domain", default)]
    pub domain: String,
    #[serde(rename = "Type", default)]
    pub doc_type: String,
    #[serde(rename = "Complexity", default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    #[serde(rename = "Security", default, skip_serializing_if = "Option::is_none")]
    pub security: Option<Security>,
    #[serde(rename = "Target Audience", default)]
    pub target_audience: String,
}

/// Resumen estructurado que devuelve el LLM para un fichero.
///
/// Las claves que el modelo añada y no estén tipadas se conservan en `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentSummary {
    #[serde(rename = "Document Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<DocumentDescription>,
    #[serde(rename = "Metadata")]
    pub metadata: MetadataBlock,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Registro completo que se indexa en la colección de documentos.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentRecord {
    #[serde(rename = "Document Name")]
    pub name: String,
    #[serde(rename = "Document Source")]
    pub source: String,
    #[serde(rename = "Data Type")]
    pub data_type: DataType,
    #[serde(rename = "Video Source", default, skip_serializing_if = "Option::is_none")]
    pub video_source: Option<String>,
    #[serde(rename = "Audio Source", default, skip_serializing_if = "Option::is_none")]
    pub audio_source: Option<String>,
    #[serde(rename = "Video Id", default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(flatten)]
    pub summary: DocumentSummary,
}

impl DocumentRecord {
    /// Añade los campos de procedencia a un resumen recién extraído.
    pub fn new(summary: DocumentSummary, source: &Path, name: &str, data_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            source: source.to_string_lossy().into_owned(),
            data_type,
            video_source: None,
            audio_source: None,
            video_id: None,
            summary,
        }
    }

    /// Procedencia de un medio alojado externamente (vídeo o audio).
    pub fn with_media(mut self, media_path: &Path, video_id: String) -> Self {
        let media = media_path.to_string_lossy().into_owned();
        match self.data_type {
            DataType::Audio => self.audio_source = Some(media),
            _ => self.video_source = Some(media),
        }
        self.video_id = Some(video_id);
        self
    }

    /// Ruta del medio que se muestra al usuario para este registro.
    pub fn display_source(&self) -> Option<&str> {
        match self.data_type {
            DataType::Text | DataType::Image => Some(self.source.as_str()),
            DataType::Audio => self.audio_source.as_deref(),
            DataType::Video => self.video_source.as_deref(),
        }
    }
}

/// Documento devuelto por una búsqueda, con su id en el índice.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub id: String,
    pub record: DocumentRecord,
}

/// Rutas de medios agrupadas por tipo, para acompañar la respuesta.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FileSources {
    pub text: Vec<String>,
    pub image: Vec<String>,
    pub audio: Vec<String>,
    pub video: Vec<String>,
}

impl FileSources {
    pub fn from_documents(docs: &[IndexedDocument]) -> Self {
        let mut sources = FileSources::default();
        for doc in docs {
            let Some(path) = doc.record.display_source().filter(|p| !p.is_empty()) else {
                continue;
            };
            let bucket = match doc.record.data_type {
                DataType::Text => &mut sources.text,
                DataType::Image => &mut sources.image,
                DataType::Audio => &mut sources.audio,
                DataType::Video => &mut sources.video,
            };
            bucket.push(path.to_string());
        }
        sources
    }
}
