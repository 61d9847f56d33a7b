//! Espera de trabajos remotos asíncronos (runs del asistente, subidas de vídeo).
//!
//! Sustituye los bucles "dormir y volver a consultar" sin límite por una espera
//! con intervalo fijo, plazo máximo y señal de cancelación.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("el trabajo remoto no terminó en {0:?}")]
    Timeout(Duration),
    #[error("espera cancelada")]
    Cancelled,
    #[error(transparent)]
    Probe(#[from] anyhow::Error),
}

/// Extremo que dispara la cancelación.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Extremo que observa la cancelación.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// Crea un par (disparador, señal) nuevo.
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, CancelSignal { rx })
    }

    /// Señal que nunca se dispara.
    pub fn never() -> Self {
        let (_, signal) = Self::pair();
        signal
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Se completa cuando se cancela; si el disparador desaparece, no se completa nunca.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Ejecuta `probe` cada `settings.interval` hasta que devuelva `Some`.
///
/// La primera consulta se hace de inmediato. Falla con `Timeout` al superar el
/// plazo, con `Cancelled` si se dispara la señal, y con `Probe` si la propia
/// consulta devuelve error (sin reintentos).
pub async fn poll_until<T, F, Fut>(
    settings: PollSettings,
    cancel: &CancelSignal,
    mut probe: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let deadline = Instant::now() + settings.timeout;
    let mut cancel = cancel.clone();

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        let attempt = tokio::select! {
            result = tokio::time::timeout_at(deadline, probe()) => result,
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
        };
        match attempt {
            Ok(Ok(Some(value))) => return Ok(value),
            Ok(Ok(None)) => {}
            Ok(Err(err)) => return Err(PollError::Probe(err)),
            Err(_) => return Err(PollError::Timeout(settings.timeout)),
        }

        if Instant::now() + settings.interval > deadline {
            return Err(PollError::Timeout(settings.timeout));
        }
        tokio::select! {
            _ = sleep(settings.interval) => {}
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn fast() -> PollSettings {
        PollSettings::new(Duration::from_millis(5), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn returns_once_probe_reports_terminal_state() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = poll_until(fast(), &CancelSignal::never(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>((n >= 2).then_some("completed"))
            }
        })
        .await;
        assert_eq!(assert_ok!(result), "completed");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn times_out_when_job_never_finishes() {
        let settings = PollSettings::new(Duration::from_millis(5), Duration::from_millis(40));
        let result: Result<(), _> =
            poll_until(settings, &CancelSignal::never(), || async { Ok::<_, anyhow::Error>(None) }).await;
        assert!(matches!(assert_err!(result), PollError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let (handle, signal) = CancelSignal::pair();
        let waiter = tokio::spawn(async move {
            poll_until::<(), _, _>(fast(), &signal, || async { Ok::<_, anyhow::Error>(None) }).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let result = waiter.await.expect("tarea");
        assert!(matches!(result, Err(PollError::Cancelled)));
    }

    #[tokio::test]
    async fn probe_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = poll_until(fast(), &CancelSignal::never(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("503 del servicio"))
            }
        })
        .await;
        assert!(matches!(result, Err(PollError::Probe(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
