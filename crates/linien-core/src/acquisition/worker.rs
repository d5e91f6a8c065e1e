//! The worker side of the acquisition channel.
//!
//! [`run_worker`] owns an [`AcquisitionService`] and serves one channel:
//!
//! 1. announce `Ready`
//! 2. drain every queued command without blocking; `Shutdown` ends the loop
//! 3. pull data and push a frame if its hash differs from the last one sent
//! 4. sleep for the poll interval and repeat
//!
//! Commands are decoded by a separate reader task so that draining never
//! waits on the channel.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use super::payload::ContentHash;
use super::protocol::{Command, WorkerMessage};
use super::service::{AcquisitionService, DataPoll};
use crate::config::AcquisitionConfig;
use crate::error::Result;
use crate::ipc::{read_message, write_message};

/// Options for the worker loop.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: AcquisitionConfig::WORKER_POLL_INTERVAL,
        }
    }
}

impl WorkerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A `Shutdown` command was received.
    Shutdown,
    /// The supervisor side of the channel went away.
    ChannelClosed,
}

/// Serve the acquisition channel until shutdown or disconnect.
pub async fn run_worker<S, R, W>(
    mut service: S,
    reader: R,
    mut writer: W,
    options: WorkerOptions,
) -> Result<WorkerExit>
where
    S: AcquisitionService,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send,
{
    let (tx, mut commands) = mpsc::unbounded_channel();
    let reader_task = tokio::spawn(read_commands(reader, tx));

    write_message(&mut writer, &WorkerMessage::Ready).await?;
    info!("Acquisition worker ready");

    let mut last_hash: Option<ContentHash> = None;
    let exit = 'serve: loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Shutdown) => {
                    info!("Acquisition worker shutting down");
                    break 'serve WorkerExit::Shutdown;
                }
                Ok(command) => {
                    let name = command.name();
                    if let Err(e) = apply(&mut service, command) {
                        warn!("Command {} failed: {}", name, e);
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    info!("Supervisor closed the acquisition channel");
                    break 'serve WorkerExit::ChannelClosed;
                }
            }
        }

        match service.return_data(last_hash.as_ref()) {
            Ok(DataPoll::Changed { hash, frame }) => {
                last_hash = Some(hash);
                if let Err(e) = write_message(&mut writer, &WorkerMessage::Frame(frame)).await {
                    debug!("Sending frame failed: {}", e);
                    break WorkerExit::ChannelClosed;
                }
            }
            Ok(DataPoll::Unchanged) => {}
            Err(e) => warn!("Fetching acquisition data failed: {}", e),
        }

        tokio::time::sleep(options.poll_interval).await;
    };

    reader_task.abort();
    Ok(exit)
}

async fn read_commands<R>(mut reader: R, tx: mpsc::UnboundedSender<Command>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_message::<Command, _>(&mut reader).await {
            Ok(Some(command)) => {
                if tx.send(command).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping acquisition channel after bad command: {}", e);
                break;
            }
        }
    }
}

fn apply<S: AcquisitionService>(service: &mut S, command: Command) -> Result<()> {
    debug!("Applying {}", command.name());
    match command {
        Command::Shutdown => Ok(()),
        Command::SetSweepSpeed { speed } => service.set_sweep_speed(speed),
        Command::SetLockStatus { locked } => service.set_lock_status(locked),
        Command::SetCsr { key, value } => service.set_csr(&key, value),
        Command::SetIirCsr { coefficients } => service.set_iir_csr(&coefficients),
        Command::PauseAcquisition => service.pause_acquisition(),
        Command::ContinueAcquisition { correlation_id } => {
            service.continue_acquisition(correlation_id)
        }
        Command::FetchAdditionalSignals { enabled } => {
            service.set_fetch_additional_signals(enabled)
        }
        Command::SetRawAcquisition {
            enabled,
            decimation,
        } => service.set_raw_acquisition(enabled, decimation),
        Command::SetDualChannel { enabled } => service.set_dual_channel(enabled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::payload::CorrelationId;
    use crate::acquisition::protocol::{IirCoefficients, ResultFrame};
    use crate::acquisition::service::SimulatedAcquisition;
    use std::sync::{Arc, Mutex};
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    /// Records applied commands, delegating data to a simulated source.
    struct Recording {
        inner: SimulatedAcquisition,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recording {
        fn record(&self, entry: String) {
            self.log.lock().unwrap().push(entry);
        }
    }

    impl AcquisitionService for Recording {
        fn set_sweep_speed(&mut self, speed: u32) -> Result<()> {
            self.record(format!("sweep {}", speed));
            self.inner.set_sweep_speed(speed)
        }

        fn set_lock_status(&mut self, locked: bool) -> Result<()> {
            self.record(format!("lock {}", locked));
            self.inner.set_lock_status(locked)
        }

        fn set_csr(&mut self, key: &str, value: i64) -> Result<()> {
            self.record(format!("csr {} {}", key, value));
            self.inner.set_csr(key, value)
        }

        fn set_iir_csr(&mut self, coefficients: &IirCoefficients) -> Result<()> {
            self.record(format!("iir {}", coefficients.filter));
            self.inner.set_iir_csr(coefficients)
        }

        fn pause_acquisition(&mut self) -> Result<()> {
            self.record("pause".into());
            self.inner.pause_acquisition()
        }

        fn continue_acquisition(&mut self, correlation_id: CorrelationId) -> Result<()> {
            self.record(format!("continue {}", correlation_id));
            self.inner.continue_acquisition(correlation_id)
        }

        fn set_fetch_additional_signals(&mut self, enabled: bool) -> Result<()> {
            self.record(format!("additional {}", enabled));
            self.inner.set_fetch_additional_signals(enabled)
        }

        fn set_raw_acquisition(&mut self, enabled: bool, decimation: u32) -> Result<()> {
            self.record(format!("raw {} {}", enabled, decimation));
            self.inner.set_raw_acquisition(enabled, decimation)
        }

        fn set_dual_channel(&mut self, enabled: bool) -> Result<()> {
            self.record(format!("dual {}", enabled));
            self.inner.set_dual_channel(enabled)
        }

        fn return_data(&mut self, last_hash: Option<&ContentHash>) -> Result<DataPoll> {
            self.inner.return_data(last_hash)
        }
    }

    struct Harness {
        to_worker: WriteHalf<DuplexStream>,
        from_worker: ReadHalf<DuplexStream>,
        log: Arc<Mutex<Vec<String>>>,
        worker: tokio::task::JoinHandle<Result<WorkerExit>>,
    }

    fn start() -> Harness {
        let (parent, child) = duplex(1 << 20);
        let (child_read, child_write) = split(child);
        let (from_worker, to_worker) = split(parent);
        let log = Arc::new(Mutex::new(Vec::new()));
        let service = Recording {
            inner: SimulatedAcquisition::new(),
            log: log.clone(),
        };
        let options = WorkerOptions::new().with_poll_interval(Duration::from_millis(5));
        let worker = tokio::spawn(run_worker(service, child_read, child_write, options));
        Harness {
            to_worker,
            from_worker,
            log,
            worker,
        }
    }

    async fn next_frame(reader: &mut ReadHalf<DuplexStream>) -> ResultFrame {
        match read_message::<WorkerMessage, _>(reader).await.unwrap() {
            Some(WorkerMessage::Frame(frame)) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ready_is_sent_first() {
        let mut h = start();
        let first = read_message::<WorkerMessage, _>(&mut h.from_worker).await.unwrap();
        assert_eq!(first, Some(WorkerMessage::Ready));
        next_frame(&mut h.from_worker).await;
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_are_not_processed() {
        let mut h = start();
        for command in [
            Command::SetSweepSpeed { speed: 5 },
            Command::Shutdown,
            Command::SetCsr {
                key: "x".into(),
                value: 1,
            },
        ] {
            write_message(&mut h.to_worker, &command).await.unwrap();
        }

        let exit = h.worker.await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::Shutdown);
        assert_eq!(*h.log.lock().unwrap(), ["sweep 5"]);
    }

    #[tokio::test]
    async fn test_identical_data_is_sent_once() {
        let mut h = start();
        read_message::<WorkerMessage, _>(&mut h.from_worker).await.unwrap();
        let first = next_frame(&mut h.from_worker).await;

        let quiet = tokio::time::timeout(
            Duration::from_millis(100),
            read_message::<WorkerMessage, _>(&mut h.from_worker),
        )
        .await;
        assert!(quiet.is_err(), "no second frame while state is unchanged");

        write_message(
            &mut h.to_worker,
            &Command::SetCsr {
                key: "logic_target_position".into(),
                value: 300,
            },
        )
        .await
        .unwrap();
        let second = next_frame(&mut h.from_worker).await;
        assert_ne!(first.payload, second.payload);
    }

    #[tokio::test]
    async fn test_continue_tags_next_frame() {
        let mut h = start();
        read_message::<WorkerMessage, _>(&mut h.from_worker).await.unwrap();
        next_frame(&mut h.from_worker).await;

        write_message(&mut h.to_worker, &Command::PauseAcquisition).await.unwrap();
        write_message(
            &mut h.to_worker,
            &Command::ContinueAcquisition {
                correlation_id: CorrelationId(42),
            },
        )
        .await
        .unwrap();

        let frame = next_frame(&mut h.from_worker).await;
        assert_eq!(frame.correlation_id, Some(CorrelationId(42)));
        assert_eq!(*h.log.lock().unwrap(), ["pause", "continue 42"]);
    }

    #[tokio::test]
    async fn test_every_command_is_dispatched() {
        let mut h = start();
        let commands = [
            Command::SetLockStatus { locked: true },
            Command::SetIirCsr {
                coefficients: IirCoefficients {
                    filter: "fast_a_iir_a".into(),
                    b: vec![1.0],
                    a: vec![1.0],
                },
            },
            Command::FetchAdditionalSignals { enabled: true },
            Command::SetRawAcquisition {
                enabled: true,
                decimation: 3,
            },
            Command::SetDualChannel { enabled: true },
            Command::Shutdown,
        ];
        for command in &commands {
            write_message(&mut h.to_worker, command).await.unwrap();
        }

        h.worker.await.unwrap().unwrap();
        assert_eq!(
            *h.log.lock().unwrap(),
            [
                "lock true",
                "iir fast_a_iir_a",
                "additional true",
                "raw true 3",
                "dual true"
            ]
        );
    }

    #[tokio::test]
    async fn test_worker_exits_when_supervisor_disconnects() {
        let mut h = start();
        read_message::<WorkerMessage, _>(&mut h.from_worker).await.unwrap();
        drop(h.to_worker);
        drop(h.from_worker);

        let exit = h.worker.await.unwrap().unwrap();
        assert_eq!(exit, WorkerExit::ChannelClosed);
    }
}
