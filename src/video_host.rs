//! Alojamiento externo de vídeo (VideoDB): sube un vídeo y devuelve el id
//! reproducible que se guarda como procedencia del documento.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use url::Url;

use crate::config::AppConfig;
use crate::poll::{poll_until, CancelSignal, PollSettings};

/// Destino de los vídeos originales o sintetizados.
#[async_trait]
pub trait VideoHost: Send + Sync {
    async fn upload_file(&self, path: &Path) -> Result<String>;
    async fn upload_url(&self, url: &Url) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct VideoDbClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    poll: PollSettings,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct UploadUrl {
    upload_url: String,
}

#[derive(Debug, Deserialize)]
struct MediaData {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    output_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    response: Option<Envelope<MediaData>>,
}

impl VideoDbClient {
    pub fn new(base_url: &str, api_key: &str, poll: PollSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("No se pudo construir el cliente HTTP de VideoDB")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            poll,
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Self::new(
            &cfg.video_db_base_url,
            &cfg.video_db_api_key,
            PollSettings::new(Duration::from_secs(2), cfg.run_timeout),
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        };
        self.http.request(method, url).header("x-access-token", &self.api_key)
    }

    async fn send<T: DeserializeOwned>(builder: RequestBuilder, what: &str) -> Result<T> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Fallo de red en VideoDB ({what})"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("VideoDB respondió {status} en {what}: {body}"));
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("Respuesta inesperada de VideoDB ({what})"))
    }

    /// Registra un medio ya accesible por URL y espera a que quede procesado.
    async fn register(&self, media_url: &str, name: &str) -> Result<String> {
        let body = json!({ "url": media_url, "name": name, "media_type": "video" });
        let envelope: Envelope<MediaData> = Self::send(
            self.request(Method::POST, "collection/default/upload").json(&body),
            "registro de vídeo",
        )
        .await?;

        if envelope.success == Some(false) {
            return Err(anyhow!(
                "VideoDB rechazó el vídeo: {}",
                envelope.message.unwrap_or_default()
            ));
        }
        let data = envelope
            .data
            .ok_or_else(|| anyhow!("VideoDB no devolvió datos del vídeo"))?;

        if envelope.status.as_deref() != Some("processing") {
            return data.id.ok_or_else(|| anyhow!("VideoDB no devolvió id de vídeo"));
        }

        let job_url = data
            .output_url
            .ok_or_else(|| anyhow!("VideoDB no devolvió la URL del trabajo de subida"))?;
        self.wait_for_job(&job_url).await
    }

    async fn wait_for_job(&self, job_url: &str) -> Result<String> {
        let this = self;
        let id = poll_until(self.poll, &CancelSignal::never(), move || async move {
            let job: JobStatus = Self::send(
                this.request(Method::GET, job_url),
                "estado de subida",
            )
            .await?;
            match job.status.as_str() {
                "processing" | "queued" | "in_progress" => Ok(None),
                "done" => {
                    let id = job
                        .response
                        .and_then(|r| r.data)
                        .and_then(|d| d.id)
                        .ok_or_else(|| anyhow!("El trabajo terminó sin id de vídeo"))?;
                    Ok(Some(id))
                }
                other => Err(anyhow!("La subida a VideoDB terminó en estado '{other}'")),
            }
        })
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl VideoHost for VideoDbClient {
    async fn upload_file(&self, path: &Path) -> Result<String> {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "video".to_string());

        let target: Envelope<UploadUrl> = Self::send(
            self.request(Method::GET, "collection/default/upload_url")
                .query(&[("name", name.as_str())]),
            "URL de subida",
        )
        .await?;
        let upload_url = target
            .data
            .map(|d| d.upload_url)
            .ok_or_else(|| anyhow!("VideoDB no devolvió URL de subida"))?;

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("No se pudo leer el vídeo {}", path.display()))?;
        let resp = self
            .http
            .put(&upload_url)
            .body(bytes)
            .send()
            .await
            .context("Fallo de red subiendo el vídeo a VideoDB")?;
        if !resp.status().is_success() {
            return Err(anyhow!("La subida del vídeo falló con {}", resp.status()));
        }

        let id = self.register(&upload_url, &name).await?;
        info!("Vídeo {} alojado en VideoDB con id {}", path.display(), id);
        Ok(id)
    }

    async fn upload_url(&self, url: &Url) -> Result<String> {
        let name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back().map(str::to_string))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "video".to_string());
        let id = self.register(url.as_str(), &name).await?;
        info!("Vídeo {} alojado en VideoDB con id {}", url, id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> VideoDbClient {
        VideoDbClient::new(
            &server.uri(),
            "vdb-key",
            PollSettings::new(Duration::from_millis(5), Duration::from_secs(2)),
        )
        .expect("cliente")
    }

    #[tokio::test]
    async fn file_upload_goes_through_presigned_url_and_job() {
        let server = MockServer::start().await;
        let presigned = format!("{}/bucket/clip", server.uri());
        let job = format!("{}/async-response/job-1", server.uri());

        Mock::given(method("GET"))
            .and(path("/collection/default/upload_url"))
            .and(query_param("name", "clip"))
            .and(header("x-access-token", "vdb-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "data": {"upload_url": presigned}
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/bucket/clip"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collection/default/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "status": "processing", "data": {"id": "job-1", "output_url": job}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/async-response/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "processing"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/async-response/job-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "done", "response": {"success": true, "data": {"id": "m-42"}}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let video = dir.path().join("clip.mp4");
        std::fs::write(&video, b"fake mp4").expect("escribir");

        let id = client(&server).upload_file(&video).await.expect("subida");
        assert_eq!(id, "m-42");
    }

    #[tokio::test]
    async fn synchronous_registration_returns_id_directly() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collection/default/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "status": "done", "data": {"id": "m-7"}
            })))
            .mount(&server)
            .await;

        let url = Url::parse("https://cdn.example.com/talks/keynote.mp4").expect("url");
        let id = client(&server).upload_url(&url).await.expect("registro");
        assert_eq!(id, "m-7");
    }

    #[tokio::test]
    async fn rejected_registration_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collection/default/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false, "message": "formato no soportado"
            })))
            .mount(&server)
            .await;

        let url = Url::parse("https://cdn.example.com/x.avi").expect("url");
        let err = client(&server).upload_url(&url).await.expect_err("debe fallar");
        assert!(err.to_string().contains("formato no soportado"));
    }
}
