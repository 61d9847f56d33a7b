//! Conversión de medios con ffmpeg/ffprobe: extracción de audio, troceado en
//! segmentos y síntesis de un vídeo a partir de una imagen fija.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::config::AppConfig;

/// Operaciones sobre ficheros de audio y vídeo.
#[async_trait]
pub trait MediaConverter: Send + Sync {
    /// Duración total del medio.
    async fn probe_duration(&self, media: &Path) -> Result<Duration>;

    /// Escribe la pista de audio de `video` en `output`. Falla si no hay audio.
    async fn extract_audio(&self, video: &Path, output: &Path) -> Result<()>;

    /// Copia `[start, start + length)` de `audio` a `output` en mp3.
    async fn cut_segment(
        &self,
        audio: &Path,
        start: Duration,
        length: Duration,
        output: &Path,
    ) -> Result<()>;

    /// Vídeo a 1 fps con `image` fija durante toda la duración de `audio`.
    async fn synthesize_still_video(&self, image: &Path, audio: &Path, output: &Path)
        -> Result<()>;
}

/// Tramo de un audio troceado.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    pub start: Duration,
    pub length: Duration,
}

/// Divide `total` en tramos consecutivos de como mucho `chunk`.
///
/// Produce `ceil(total / chunk)` tramos cuyas duraciones suman exactamente `total`.
pub fn plan_segments(total: Duration, chunk: Duration) -> Vec<SegmentSpan> {
    if chunk.is_zero() {
        return Vec::new();
    }
    let mut spans = Vec::new();
    let mut start = Duration::ZERO;
    while start < total {
        let length = chunk.min(total - start);
        spans.push(SegmentSpan { start, length });
        start += length;
    }
    spans
}

/// Ruta del segmento `index` de `audio`: `<base>_segment_<index>.mp3`.
pub fn segment_path(audio: &Path, index: usize) -> PathBuf {
    let stem = audio
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    audio.with_file_name(format!("{stem}_segment_{index}.mp3"))
}

/// Segmentos de un audio, generados uno a uno bajo demanda.
///
/// Quien consume cada segmento es responsable de borrarlo.
pub struct AudioSegments<'a> {
    media: &'a dyn MediaConverter,
    source: PathBuf,
    spans: Vec<SegmentSpan>,
    next: usize,
}

impl<'a> AudioSegments<'a> {
    pub async fn open(media: &'a dyn MediaConverter, source: &Path, chunk: Duration) -> Result<Self> {
        let total = media.probe_duration(source).await?;
        let spans = plan_segments(total, chunk);
        debug!(
            "{} dura {:?}; se trocea en {} segmentos",
            source.display(),
            total,
            spans.len()
        );
        Ok(Self {
            media,
            source: source.to_path_buf(),
            spans,
            next: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Genera el siguiente segmento, o `None` cuando se han agotado.
    pub async fn next(&mut self) -> Option<Result<PathBuf>> {
        let span = *self.spans.get(self.next)?;
        let output = segment_path(&self.source, self.next);
        self.next += 1;
        let result = self
            .media
            .cut_segment(&self.source, span.start, span.length, &output)
            .await
            .map(|_| output);
        Some(result)
    }
}

/// Conversor basado en los binarios de ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegConverter {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegConverter {
    pub fn new(ffmpeg: &str, ffprobe: &str) -> Self {
        Self {
            ffmpeg: ffmpeg.to_string(),
            ffprobe: ffprobe.to_string(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(&cfg.ffmpeg_bin, &cfg.ffprobe_bin)
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("Ejecutando {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("No se pudo lanzar {program}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join("\n");
            return Err(anyhow!(
                "{program} terminó con {}: {}",
                output.status,
                tail
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn has_audio_stream(&self, media: &Path) -> Result<bool> {
        let media = path_arg(media)?;
        let out = self
            .run(
                &self.ffprobe,
                &[
                    "-v", "error",
                    "-select_streams", "a",
                    "-show_entries", "stream=index",
                    "-of", "csv=p=0",
                    media,
                ],
            )
            .await?;
        Ok(!out.trim().is_empty())
    }
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("Ruta no UTF-8: {}", path.display()))
}

fn seconds_arg(value: Duration) -> String {
    format!("{:.3}", value.as_secs_f64())
}

#[async_trait]
impl MediaConverter for FfmpegConverter {
    async fn probe_duration(&self, media: &Path) -> Result<Duration> {
        let path = path_arg(media)?;
        let out = self
            .run(
                &self.ffprobe,
                &[
                    "-v", "error",
                    "-show_entries", "format=duration",
                    "-of", "default=noprint_wrappers=1:nokey=1",
                    path,
                ],
            )
            .await?;
        let seconds: f64 = out
            .trim()
            .parse()
            .with_context(|| format!("Duración ilegible para {}: '{}'", media.display(), out.trim()))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(anyhow!("Duración inválida para {}: {seconds}", media.display()));
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    async fn extract_audio(&self, video: &Path, output: &Path) -> Result<()> {
        if !self.has_audio_stream(video).await? {
            return Err(anyhow!("El vídeo {} no tiene pista de audio", video.display()));
        }
        self.run(
            &self.ffmpeg,
            &["-y", "-i", path_arg(video)?, "-vn", path_arg(output)?],
        )
        .await?;
        Ok(())
    }

    async fn cut_segment(
        &self,
        audio: &Path,
        start: Duration,
        length: Duration,
        output: &Path,
    ) -> Result<()> {
        let start = seconds_arg(start);
        let length = seconds_arg(length);
        self.run(
            &self.ffmpeg,
            &[
                "-y",
                "-ss", &start,
                "-t", &length,
                "-i", path_arg(audio)?,
                "-vn",
                "-acodec", "libmp3lame",
                path_arg(output)?,
            ],
        )
        .await?;
        Ok(())
    }

    async fn synthesize_still_video(
        &self,
        image: &Path,
        audio: &Path,
        output: &Path,
    ) -> Result<()> {
        self.run(
            &self.ffmpeg,
            &[
                "-y",
                "-loop", "1",
                "-framerate", "1",
                "-i", path_arg(image)?,
                "-i", path_arg(audio)?,
                "-c:v", "libx264",
                "-tune", "stillimage",
                "-pix_fmt", "yuv420p",
                "-c:a", "aac",
                "-r", "1",
                "-shortest",
                path_arg(output)?,
            ],
        )
        .await?;
        Ok(())
    }
}
