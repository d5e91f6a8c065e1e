//! Supervisor of the acquisition worker.
//!
//! Startup is two-phase: launch the worker, then wait for its `Ready`
//! message with a timeout. Afterwards a reader task hands every frame to the
//! subscriber and a writer task forwards commands. Neither side waits for the
//! other; commands are never acknowledged.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::hooks::{EnvironmentHooks, NoopHooks, RestoreGuard};
use super::payload::CorrelationId;
use super::protocol::{Command, IirCoefficients, ResultFrame, WorkerMessage};
use super::service::AcquisitionService;
use super::worker::{run_worker, WorkerExit, WorkerOptions};
use crate::config::{AcquisitionConfig, AppConfig};
use crate::error::{LinienError, Result};
use crate::ipc::{read_message, write_message};

/// Callback receiving every frame, on the supervisor's reader task.
pub type FrameSubscriber = Arc<dyn Fn(ResultFrame) + Send + Sync>;

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// How the worker is brought up.
pub enum WorkerLaunch {
    /// Child process speaking the channel protocol on stdin/stdout.
    Process { program: PathBuf, args: Vec<String> },
    /// Worker loop on a task of the current runtime.
    InProcess(Box<dyn AcquisitionService>),
    /// Manually launched worker listening on TCP (debug mode).
    Remote { addr: SocketAddr },
}

impl WorkerLaunch {
    /// The worker binary installed next to the current executable.
    pub fn sibling_binary() -> Result<Self> {
        let program = std::env::current_exe()?.with_file_name(AppConfig::ACQUISITION_BINARY_NAME);
        Ok(WorkerLaunch::Process {
            program,
            args: Vec::new(),
        })
    }

    /// Debug-mode worker on `host` at the default acquisition port.
    pub fn remote(host: std::net::IpAddr) -> Self {
        WorkerLaunch::Remote {
            addr: SocketAddr::new(host, AcquisitionConfig::DEBUG_PORT),
        }
    }

    /// Whether the worker touches this machine's hardware.
    pub fn is_local(&self) -> bool {
        !matches!(self, WorkerLaunch::Remote { .. })
    }
}

impl fmt::Debug for WorkerLaunch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerLaunch::Process { program, args } => f
                .debug_struct("Process")
                .field("program", program)
                .field("args", args)
                .finish(),
            WorkerLaunch::InProcess(_) => f.write_str("InProcess"),
            WorkerLaunch::Remote { addr } => f.debug_struct("Remote").field("addr", addr).finish(),
        }
    }
}

/// Options for [`AcquisitionController::start`].
pub struct AcquisitionOptions {
    pub launch: WorkerLaunch,
    pub ready_timeout: Duration,
    pub hooks: Arc<dyn EnvironmentHooks>,
    /// Loop options of an in-process worker.
    pub worker: WorkerOptions,
}

impl AcquisitionOptions {
    pub fn new(launch: WorkerLaunch) -> Self {
        Self {
            launch,
            ready_timeout: AcquisitionConfig::READY_TIMEOUT,
            hooks: Arc::new(NoopHooks),
            worker: WorkerOptions::default(),
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn EnvironmentHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_worker_options(mut self, worker: WorkerOptions) -> Self {
        self.worker = worker;
        self
    }
}

impl fmt::Debug for AcquisitionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionOptions")
            .field("launch", &self.launch)
            .field("ready_timeout", &self.ready_timeout)
            .field("worker", &self.worker)
            .finish()
    }
}

/// Liveness of the worker channel as seen by the reader task.
#[derive(Debug, Clone, Default)]
pub struct ChannelStatus {
    pub alive: bool,
    pub frames_received: u64,
    pub last_frame_at: Option<Instant>,
}

/// Cloneable, non-blocking command handle.
///
/// Sends fail only once the channel to the worker is gone.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    pub fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| LinienError::WorkerChannelClosed)
    }

    pub fn pause_acquisition(&self) -> Result<()> {
        self.send(Command::PauseAcquisition)
    }

    pub fn continue_acquisition(&self, correlation_id: CorrelationId) -> Result<()> {
        self.send(Command::ContinueAcquisition { correlation_id })
    }

    pub fn set_sweep_speed(&self, speed: u32) -> Result<()> {
        self.send(Command::SetSweepSpeed { speed })
    }

    pub fn set_lock_status(&self, locked: bool) -> Result<()> {
        self.send(Command::SetLockStatus { locked })
    }

    pub fn set_csr(&self, key: impl Into<String>, value: i64) -> Result<()> {
        self.send(Command::SetCsr {
            key: key.into(),
            value,
        })
    }

    pub fn set_iir_csr(&self, coefficients: IirCoefficients) -> Result<()> {
        self.send(Command::SetIirCsr { coefficients })
    }

    pub fn fetch_additional_signals(&self, enabled: bool) -> Result<()> {
        self.send(Command::FetchAdditionalSignals { enabled })
    }

    pub fn set_raw_acquisition(&self, enabled: bool, decimation: u32) -> Result<()> {
        self.send(Command::SetRawAcquisition {
            enabled,
            decimation,
        })
    }

    pub fn set_dual_channel(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetDualChannel { enabled })
    }
}

enum WorkerHandle {
    Child(Child),
    Task(JoinHandle<Result<WorkerExit>>),
    Remote,
}

/// Synchronous shutdown usable from a signal handler.
///
/// Enqueues `Shutdown` for the worker before the environment is restored, the
/// same order as [`AcquisitionController::shutdown`].
#[derive(Debug, Clone)]
pub struct ExitHook {
    commands: CommandSender,
    restore: RestoreGuard,
}

impl ExitHook {
    pub fn run(&self) {
        shutdown_then_restore(&self.commands, &self.restore);
    }
}

fn shutdown_then_restore(commands: &CommandSender, restore: &RestoreGuard) {
    if commands.send(Command::Shutdown).is_err() {
        debug!("Acquisition channel already closed at shutdown");
    }
    restore.restore();
}

/// Supervisor owning the worker, its channel, and the restore hook.
///
/// Dropping the controller sends `Shutdown` and restores the environment.
/// Prefer [`AcquisitionController::stop`] to also wait for the worker.
pub struct AcquisitionController {
    commands: CommandSender,
    status: Arc<Mutex<ChannelStatus>>,
    restore: RestoreGuard,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    worker: Option<WorkerHandle>,
}

impl fmt::Debug for AcquisitionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquisitionController")
            .field("status", &self.status())
            .field("restore", &self.restore)
            .finish()
    }
}

impl AcquisitionController {
    /// Suspend the environment, launch the worker and wait until it is ready.
    ///
    /// Any failure is final: the environment is restored and the error
    /// returned. There is no retry.
    pub async fn start(options: AcquisitionOptions, subscriber: FrameSubscriber) -> Result<Self> {
        let AcquisitionOptions {
            launch,
            ready_timeout,
            hooks,
            worker,
        } = options;

        let restore = if launch.is_local() {
            let guard = RestoreGuard::armed(hooks.clone());
            if let Err(e) = hooks.suspend() {
                guard.restore();
                return Err(e);
            }
            guard
        } else {
            RestoreGuard::disarmed()
        };

        info!("Starting acquisition worker: {:?}", launch);
        let started = async {
            let (mut reader, writer, handle) = launch_worker(launch, worker).await?;
            await_ready(&mut reader, ready_timeout).await?;
            Ok::<_, LinienError>((reader, writer, handle))
        }
        .await;

        let (reader, writer, handle) = match started {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Acquisition worker failed to start: {}", e);
                restore.restore();
                return Err(e);
            }
        };
        info!("Acquisition worker is ready");

        let status = Arc::new(Mutex::new(ChannelStatus {
            alive: true,
            ..Default::default()
        }));
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            commands: CommandSender { tx },
            reader: Some(tokio::spawn(receive_frames(reader, subscriber, status.clone()))),
            writer: Some(tokio::spawn(forward_commands(writer, rx))),
            status,
            restore,
            worker: Some(handle),
        })
    }

    /// A command handle that can be moved into callbacks.
    pub fn commands(&self) -> CommandSender {
        self.commands.clone()
    }

    /// Shutdown handle for process exit handlers.
    pub fn exit_hook(&self) -> ExitHook {
        ExitHook {
            commands: self.commands.clone(),
            restore: self.restore.clone(),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        lock_status(&self.status).clone()
    }

    pub fn pause_acquisition(&self) -> Result<()> {
        self.commands.pause_acquisition()
    }

    pub fn continue_acquisition(&self, correlation_id: CorrelationId) -> Result<()> {
        self.commands.continue_acquisition(correlation_id)
    }

    pub fn set_sweep_speed(&self, speed: u32) -> Result<()> {
        self.commands.set_sweep_speed(speed)
    }

    pub fn set_lock_status(&self, locked: bool) -> Result<()> {
        self.commands.set_lock_status(locked)
    }

    pub fn set_csr(&self, key: impl Into<String>, value: i64) -> Result<()> {
        self.commands.set_csr(key, value)
    }

    pub fn set_iir_csr(&self, coefficients: IirCoefficients) -> Result<()> {
        self.commands.set_iir_csr(coefficients)
    }

    pub fn fetch_additional_signals(&self, enabled: bool) -> Result<()> {
        self.commands.fetch_additional_signals(enabled)
    }

    pub fn set_raw_acquisition(&self, enabled: bool, decimation: u32) -> Result<()> {
        self.commands.set_raw_acquisition(enabled, decimation)
    }

    pub fn set_dual_channel(&self, enabled: bool) -> Result<()> {
        self.commands.set_dual_channel(enabled)
    }

    /// Ask the worker to stop and restore the environment. Does not wait.
    pub fn shutdown(&self) {
        shutdown_then_restore(&self.commands, &self.restore);
    }

    /// Shut down and wait for the worker to exit.
    pub async fn stop(mut self) -> Result<()> {
        self.shutdown();
        let deadline = AcquisitionConfig::STOP_TIMEOUT;

        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(deadline, writer).await.is_err() {
                warn!("Command writer did not finish within {:?}", deadline);
            }
        }

        match self.worker.take() {
            Some(WorkerHandle::Child(mut child)) => {
                match tokio::time::timeout(deadline, child.wait()).await {
                    Ok(status) => debug!("Acquisition worker exited: {:?}", status?),
                    Err(_) => {
                        warn!("Acquisition worker ignored shutdown, killing it");
                        child.kill().await?;
                    }
                }
            }
            Some(WorkerHandle::Task(task)) => match tokio::time::timeout(deadline, task).await {
                Ok(Ok(Ok(exit))) => debug!("Acquisition worker exited: {:?}", exit),
                Ok(Ok(Err(e))) => warn!("Acquisition worker failed: {}", e),
                Ok(Err(e)) => warn!("Acquisition worker task failed: {}", e),
                Err(_) => warn!("Acquisition worker did not stop within {:?}", deadline),
            },
            Some(WorkerHandle::Remote) | None => {}
        }

        if let Some(reader) = self.reader.take() {
            if tokio::time::timeout(deadline, reader).await.is_err() {
                debug!("Frame reader still running after stop, aborting");
            }
        }
        Ok(())
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn lock_status(status: &Mutex<ChannelStatus>) -> std::sync::MutexGuard<'_, ChannelStatus> {
    status.lock().unwrap_or_else(|e| e.into_inner())
}

async fn launch_worker(
    launch: WorkerLaunch,
    options: WorkerOptions,
) -> Result<(BoxedReader, BoxedWriter, WorkerHandle)> {
    match launch {
        WorkerLaunch::Process { program, args } => {
            let mut child = tokio::process::Command::new(&program)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| LinienError::WorkerStartup {
                    reason: format!("failed to spawn {}: {}", program.display(), e),
                })?;

            let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
                return Err(LinienError::WorkerStartup {
                    reason: "worker pipes are not available".to_string(),
                });
            };
            Ok((Box::new(stdout), Box::new(stdin), WorkerHandle::Child(child)))
        }
        WorkerLaunch::InProcess(service) => {
            let (parent, child) = tokio::io::duplex(AcquisitionConfig::IN_PROCESS_BUFFER);
            let (child_read, child_write) = tokio::io::split(child);
            let task = tokio::spawn(run_worker(service, child_read, child_write, options));
            let (reader, writer) = tokio::io::split(parent);
            Ok((Box::new(reader), Box::new(writer), WorkerHandle::Task(task)))
        }
        WorkerLaunch::Remote { addr } => {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| LinienError::WorkerStartup {
                    reason: format!("failed to connect to worker at {}: {}", addr, e),
                })?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer), WorkerHandle::Remote))
        }
    }
}

async fn await_ready(reader: &mut BoxedReader, timeout: Duration) -> Result<()> {
    let message = tokio::time::timeout(timeout, read_message::<WorkerMessage, _>(reader))
        .await
        .map_err(|_| LinienError::Timeout(timeout))?;

    match message {
        Ok(Some(WorkerMessage::Ready)) => Ok(()),
        Ok(Some(WorkerMessage::Frame(_))) => Err(LinienError::WorkerStartup {
            reason: "worker sent a frame before announcing readiness".to_string(),
        }),
        Ok(None) => Err(LinienError::WorkerStartup {
            reason: "worker exited before it was ready".to_string(),
        }),
        Err(e) => Err(LinienError::WorkerStartup {
            reason: e.to_string(),
        }),
    }
}

async fn receive_frames(
    mut reader: BoxedReader,
    subscriber: FrameSubscriber,
    status: Arc<Mutex<ChannelStatus>>,
) {
    loop {
        match read_message::<WorkerMessage, _>(&mut reader).await {
            Ok(Some(WorkerMessage::Frame(frame))) => {
                {
                    let mut status = lock_status(&status);
                    status.frames_received += 1;
                    status.last_frame_at = Some(Instant::now());
                }
                subscriber(frame);
            }
            Ok(Some(WorkerMessage::Ready)) => debug!("Ignoring repeated ready message"),
            Ok(None) => {
                info!("Acquisition channel closed");
                break;
            }
            Err(e) => {
                warn!("Acquisition channel failed: {}", e);
                break;
            }
        }
    }
    lock_status(&status).alive = false;
}

async fn forward_commands(mut writer: BoxedWriter, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        let shutdown = command == Command::Shutdown;
        if let Err(e) = write_message(&mut writer, &command).await {
            warn!("Sending {} to acquisition worker failed: {}", command.name(), e);
            break;
        }
        if shutdown {
            break;
        }
    }
    let _ = writer.shutdown().await;
}
