//! Worker supervisor
//!
//! Runs the processor and the listener as two independently guarded tasks
//! and turns their fate into a process exit status:
//!
//! | Event                          | Exit            |
//! |--------------------------------|-----------------|
//! | listener stopped cleanly       | 0               |
//! | signal                         | 0               |
//! | respawnable failure            | 3               |
//! | any other failure              | 1               |
//!
//! A process manager restarts the daemon on status 3.

pub mod bind_addr;
pub mod file_limit;

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use crate::{
    actors::{
        listener::{Listener, ListenerError},
        processor::{Processor, ProcessorHandle},
    },
    client::CollectorClient,
    config::Config,
};

use bind_addr::{BindAddr, parse_bind_addr};
use file_limit::{SystemFileLimits, raise_file_limit};

/// Failure of one supervised unit.
#[derive(Debug, thiserror::Error)]
#[error("{component} failed: {cause:#}")]
pub struct WorkerError {
    pub component: &'static str,
    /// Whether restarting the process may help.
    pub respawn: bool,
    pub cause: anyhow::Error,
}

impl WorkerError {
    pub fn respawnable(component: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            component,
            respawn: true,
            cause: cause.into(),
        }
    }

    pub fn fatal(component: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        Self {
            component,
            respawn: false,
            cause: cause.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Clean,
    Respawn,
    Failure,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Clean => 0,
            WorkerExit::Respawn => 3,
            WorkerExit::Failure => 1,
        }
    }
}

impl From<&WorkerError> for WorkerExit {
    fn from(err: &WorkerError) -> Self {
        if err.respawn {
            WorkerExit::Respawn
        } else {
            WorkerExit::Failure
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Poll `fut` to completion, turning a panic into a respawnable
/// [`WorkerError`]. Errors are delivered on `errors`.
///
/// Returns true if the unit finished without error.
pub async fn crash_guard<F>(
    component: &'static str,
    fut: F,
    errors: mpsc::Sender<WorkerError>,
) -> bool
where
    F: Future<Output = Result<(), WorkerError>>,
{
    let err = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => return true,
        Ok(Err(err)) => err,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            let backtrace = Backtrace::force_capture();
            WorkerError::respawnable(
                component,
                anyhow::anyhow!("panic: {message}\n{backtrace}"),
            )
        }
    };

    if errors.send(err).await.is_err() {
        debug!("{component} failed after the supervisor stopped");
    }
    false
}

/// EBADF from the listener comes from a kernel whose `epoll_create1` is
/// broken. Restarting does not help.
#[cfg(target_os = "linux")]
fn is_borked_syscall(err: &ListenerError) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::EBADF as i32)
}

#[cfg(not(target_os = "linux"))]
fn is_borked_syscall(_err: &ListenerError) -> bool {
    false
}

fn classify_listener_error(err: ListenerError) -> WorkerError {
    if is_borked_syscall(&err) {
        error!(
            "the epoll_create1 system call is not available on this system, \
             the kernel may be missing support for it"
        );
        return WorkerError::fatal(
            "listener",
            anyhow::Error::new(err).context("borked syscall: epoll_create1"),
        );
    }

    match err {
        ListenerError::RemoveStale { .. } => WorkerError::fatal("listener", err),
        err => WorkerError::respawnable("listener", err),
    }
}

async fn serve(addr: BindAddr, processor: ProcessorHandle) -> Result<(), WorkerError> {
    let listener = Listener::bind(&addr)
        .await
        .map_err(classify_listener_error)?;
    listener.run(processor).await.map_err(classify_listener_error)
}

/// Wait for SIGTERM, or SIGINT when running in the foreground.
pub async fn shutdown_signal(foreground: bool) -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = if foreground {
        Some(signal(SignalKind::interrupt())?)
    } else {
        None
    };

    let interrupted = async {
        match interrupt.as_mut() {
            Some(interrupt) => interrupt.recv().await,
            None => std::future::pending().await,
        }
    };

    Ok(tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        _ = interrupted => "SIGINT",
    })
}

/// Run the daemon until a signal arrives or a unit fails.
pub async fn run_worker(config: &Config, client: Arc<dyn CollectorClient>) -> WorkerExit {
    let foreground = config.foreground;
    let shutdown = async move {
        match shutdown_signal(foreground).await {
            Ok(name) => info!("received {name}"),
            Err(e) => {
                error!("unable to install signal handlers: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    run_worker_until(config, client, shutdown).await
}

/// Run the daemon until `shutdown` resolves or a unit fails.
#[instrument(skip_all, fields(bind_addr = %config.bind_addr))]
pub async fn run_worker_until<S>(
    config: &Config,
    client: Arc<dyn CollectorClient>,
    shutdown: S,
) -> WorkerExit
where
    S: Future<Output = ()>,
{
    info!("worker starting, pid {}", std::process::id());

    if config.max_files > 0 {
        raise_file_limit(&SystemFileLimits, config.max_files);
    }

    let addr = match parse_bind_addr(&config.bind_addr) {
        Ok(addr) => addr,
        Err(e) => {
            let err = WorkerError::fatal("listener", e);
            error!("{err}");
            return WorkerExit::from(&err);
        }
    };

    let allowlist = config.allowlist();
    if !allowlist.is_empty() {
        info!("fast harvest allow-list loaded");
    }

    let (processor, handle) = Processor::new(config.processor_config(allowlist), client);
    let (error_tx, error_rx) = mpsc::channel(2);

    let processor_task = tokio::spawn(crash_guard(
        "processor",
        async move {
            processor.run().await;
            Ok::<(), WorkerError>(())
        },
        error_tx.clone(),
    ));
    let listener_task = tokio::spawn(crash_guard(
        "listener",
        serve(addr, handle.clone()),
        error_tx,
    ));

    #[cfg(feature = "api")]
    {
        use crate::api::{ApiConfig, ApiState, spawn_api_server};

        if let Some(port) = config.diagnostics_port {
            let state = ApiState::new(handle.clone());
            if let Err(e) = spawn_api_server(ApiConfig::loopback(port), state).await {
                error!("unable to start diagnostics server: {e:#}");
            }
        }
    }

    supervise(handle, processor_task, listener_task, error_rx, shutdown).await
}

async fn supervise<S>(
    processor: ProcessorHandle,
    processor_task: tokio::task::JoinHandle<bool>,
    mut listener_task: tokio::task::JoinHandle<bool>,
    mut errors: mpsc::Receiver<WorkerError>,
    shutdown: S,
) -> WorkerExit
where
    S: Future<Output = ()>,
{
    let mut shutdown = std::pin::pin!(shutdown);

    tokio::select! {
        biased;

        Some(err) = errors.recv() => {
            error!("{err}");
            WorkerExit::from(&err)
        }

        joined = &mut listener_task => {
            match joined {
                Ok(true) => {
                    // The listener only stops once the processor is gone, which
                    // may have been a crash.
                    let _ = processor_task.await;
                    match errors.try_recv() {
                        Ok(err) => {
                            error!("{err}");
                            WorkerExit::from(&err)
                        }
                        Err(_) => {
                            info!("listener stopped");
                            WorkerExit::Clean
                        }
                    }
                }
                Ok(false) => match errors.recv().await {
                    Some(err) => {
                        error!("{err}");
                        WorkerExit::from(&err)
                    }
                    None => WorkerExit::Respawn,
                },
                Err(e) => {
                    error!("listener task failed: {e}");
                    WorkerExit::Respawn
                }
            }
        }

        _ = &mut shutdown => {
            if processor.shutdown().await.is_ok() {
                processor.closed().await;
            }
            let _ = processor_task.await;
            info!("worker stopped");
            WorkerExit::Clean
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_exit_codes() {
        assert_eq!(WorkerExit::Clean.code(), 0);
        assert_eq!(WorkerExit::Respawn.code(), 3);
        assert_eq!(WorkerExit::Failure.code(), 1);

        let err = WorkerError::respawnable("processor", anyhow::anyhow!("boom"));
        assert_eq!(WorkerExit::from(&err), WorkerExit::Respawn);
        let err = WorkerError::fatal("listener", anyhow::anyhow!("boom"));
        assert_eq!(WorkerExit::from(&err), WorkerExit::Failure);
    }

    #[tokio::test]
    async fn test_crash_guard_reports_panic() {
        let (tx, mut rx) = mpsc::channel(1);

        let clean = crash_guard(
            "processor",
            async {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), WorkerError>(())
            },
            tx,
        )
        .await;

        assert!(!clean);
        let err = rx.recv().await.unwrap();
        assert_eq!(err.component, "processor");
        assert!(err.respawn);
        assert!(err.to_string().contains("panic: kaboom"));
    }

    #[tokio::test]
    async fn test_crash_guard_forwards_errors() {
        let (tx, mut rx) = mpsc::channel(1);

        let clean = crash_guard(
            "listener",
            async { Err::<(), _>(WorkerError::fatal("listener", anyhow::anyhow!("no socket"))) },
            tx.clone(),
        )
        .await;
        assert!(!clean);
        assert_matches!(rx.recv().await, Some(WorkerError { respawn: false, .. }));

        assert!(crash_guard("listener", async { Ok::<(), WorkerError>(()) }, tx).await);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_listener_error_classification() {
        let stale = ListenerError::RemoveStale {
            path: "/tmp/x.sock".into(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(!classify_listener_error(stale).respawn);

        let accept = ListenerError::Accept(std::io::Error::from_raw_os_error(
            nix::errno::Errno::EMFILE as i32,
        ));
        assert!(classify_listener_error(accept).respawn);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_ebadf_is_not_respawnable() {
        let err = ListenerError::Bind {
            addr: "@harvestd".to_string(),
            source: std::io::Error::from_raw_os_error(nix::errno::Errno::EBADF as i32),
        };
        let err = classify_listener_error(err);
        assert!(!err.respawn);
        assert!(err.to_string().contains("epoll_create1"));
    }
}
