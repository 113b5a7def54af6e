//! # Playback Controller
//!
//! Owns the one live connection. A dedicated `pemf-worker` thread holds the
//! [`Connection`] and the session state; clients talk to it through a FIFO
//! request queue and watch a published [`StatusSnapshot`].
//!
//! Replies acknowledge a request (accepted or rejected by the current state),
//! not the completion of the device work it starts. Completion shows up in
//! the status feed. `connect` is the exception: it replies with the resolved
//! device.
//!
//! Pause and stop take effect only at row boundaries. While a row plays, any
//! other request is rejected at once.

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::executor::{
    execute_stage, instantiate, instantiate_row, ExecError, StageArgs, TemplateError, Treatment,
};
use crate::handshake::{detect, DetectionError};
use crate::link::{Connection, Connector, LinkError};
use crate::registry::{DeviceVariant, StageName};
use crate::trace::Operation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Idle,
    Loaded,
    Running,
    Paused,
    /// A stop was accepted; playback ends at the next row boundary.
    Stopping,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::Loaded => "LOADED",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Stopping => "STOPPING",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known bridge state. Always available, even mid-transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub port: Option<String>,
    pub device: Option<DeviceVariant>,
    pub run_state: RunState,
    /// Next row to play.
    pub current_row: usize,
    pub total_rows: usize,
    /// Name of the loaded treatment.
    pub treatment: Option<String>,
    /// Stage currently executing on the device.
    pub active_stage: Option<StageName>,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot {request} while {from}")]
    InvalidStateTransition {
        from: RunState,
        request: &'static str,
    },
    #[error("already connected to {port}")]
    AlreadyConnected { port: String },
    #[error("no device connected")]
    NotConnected,
    #[error("invalid treatment: {0}")]
    InvalidTreatment(String),
    #[error("row {row} is out of range for a treatment of {rows} rows")]
    RowOutOfRange { row: usize, rows: usize },
    #[error("playback worker has stopped")]
    WorkerStopped,
    #[error("failed to start playback worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Detection(#[from] DetectionError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

type Reply<T = ()> = oneshot::Sender<Result<T, BridgeError>>;

enum Request {
    Connect {
        port: String,
        reply: Reply<DeviceVariant>,
    },
    Load {
        treatment: Treatment,
        reply: Reply,
    },
    Start {
        row: usize,
        reply: Reply,
    },
    Pause(Reply),
    Resume(Reply),
    Stop(Reply),
    Unload(Reply),
    Disconnect(Reply),
    Shutdown,
}

impl Request {
    // Answers the request with an illegal-transition error.
    fn reject(self, from: RunState) {
        let err = |request| BridgeError::InvalidStateTransition { from, request };
        match self {
            Request::Connect { reply, .. } => {
                let _ = reply.send(Err(err("connect")));
            }
            Request::Load { reply, .. } => {
                let _ = reply.send(Err(err("load a treatment")));
            }
            Request::Start { reply, .. } => {
                let _ = reply.send(Err(err("start")));
            }
            Request::Pause(reply) => {
                let _ = reply.send(Err(err("pause")));
            }
            Request::Resume(reply) => {
                let _ = reply.send(Err(err("resume")));
            }
            Request::Stop(reply) => {
                let _ = reply.send(Err(err("stop")));
            }
            Request::Unload(reply) => {
                let _ = reply.send(Err(err("unload")));
            }
            Request::Disconnect(reply) => {
                let _ = reply.send(Err(err("disconnect")));
            }
            Request::Shutdown => {}
        }
    }
}

/// Client handle onto the playback worker. Dropping it shuts the worker down
/// and closes the connection.
pub struct PlaybackController {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<StatusSnapshot>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackController {
    /// Starts the worker thread. `connector` opens ports on `connect`.
    pub fn spawn<C: Connector>(connector: C, config: BridgeConfig) -> Result<Self, BridgeError> {
        let (requests, queue) = mpsc::channel();
        let (status_tx, status) = watch::channel(StatusSnapshot::default());

        let worker = Worker {
            connector,
            config,
            requests: queue,
            status: status_tx,
            link: None,
            port: None,
            device: None,
            treatment: None,
            run_state: RunState::Idle,
            current_row: 0,
            active_stage: None,
            last_error: None,
            deferred: Vec::new(),
        };
        let handle = thread::Builder::new()
            .name("pemf-worker".to_owned())
            .spawn(move || worker.run())
            .map_err(BridgeError::WorkerSpawn)?;

        Ok(Self {
            requests,
            status,
            worker: Some(handle),
        })
    }

    /// Opens `port`, runs the handshake and returns the detected device.
    pub async fn connect(&self, port: &str) -> Result<DeviceVariant, BridgeError> {
        let port = port.to_owned();
        self.request(|reply| Request::Connect { port, reply }).await
    }

    /// Stores `treatment` on the device. Accepted once validated; the store
    /// stage then runs and the state becomes LOADED (or IDLE on failure).
    pub async fn load_treatment(&self, treatment: Treatment) -> Result<(), BridgeError> {
        self.request(|reply| Request::Load { treatment, reply }).await
    }

    /// Begins playback at `start_row`, from LOADED or PAUSED.
    pub async fn start(&self, start_row: usize) -> Result<(), BridgeError> {
        self.request(|reply| Request::Start {
            row: start_row,
            reply,
        })
        .await
    }

    pub async fn pause(&self) -> Result<(), BridgeError> {
        self.request(Request::Pause).await
    }

    /// Continues a paused playback from the row it stopped before.
    pub async fn resume(&self) -> Result<(), BridgeError> {
        self.request(Request::Resume).await
    }

    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.request(Request::Stop).await
    }

    pub async fn unload(&self) -> Result<(), BridgeError> {
        self.request(Request::Unload).await
    }

    pub async fn disconnect(&self) -> Result<(), BridgeError> {
        self.request(Request::Disconnect).await
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    /// Receiver that is notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Request,
    ) -> Result<T, BridgeError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(build(reply))
            .map_err(|_| BridgeError::WorkerStopped)?;
        response.await.map_err(|_| BridgeError::WorkerStopped)?
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        let _ = self.requests.send(Request::Shutdown);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("playback worker panicked");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Stop,
}

// Everything below runs on the worker thread.
struct Worker<C> {
    connector: C,
    config: BridgeConfig,
    requests: mpsc::Receiver<Request>,
    status: watch::Sender<StatusSnapshot>,
    link: Option<Box<dyn Connection>>,
    port: Option<String>,
    device: Option<DeviceVariant>,
    treatment: Option<Treatment>,
    run_state: RunState,
    current_row: usize,
    active_stage: Option<StageName>,
    last_error: Option<String>,
    // Pause/stop accepted mid-row, applied at the next boundary.
    deferred: Vec<Control>,
}

impl<C: Connector> Worker<C> {
    fn run(mut self) {
        debug!("playback worker started");
        loop {
            let request = if self.run_state == RunState::Running {
                match self.requests.try_recv() {
                    Ok(request) => Some(request),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match self.requests.recv() {
                    Ok(request) => Some(request),
                    Err(_) => break,
                }
            };

            if let Some(request) = request {
                if !self.handle(request) {
                    break;
                }
            }
            if self.run_state == RunState::Running && !self.step() {
                break;
            }
        }
        debug!("playback worker stopped");
    }

    // Returns false when the worker should exit.
    fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::Connect { port, reply } => {
                let result = self.connect(&port);
                self.respond(reply, result);
            }
            Request::Load { treatment, reply } => self.load(treatment, reply),
            Request::Start { row, reply } => {
                let result = self.start(row);
                self.respond(reply, result);
            }
            Request::Pause(reply) => {
                let result = match self.run_state {
                    RunState::Running => {
                        info!(row = self.current_row, "playback paused");
                        self.active_stage = None;
                        self.run_state = RunState::Paused;
                        Ok(())
                    }
                    from => Err(BridgeError::InvalidStateTransition {
                        from,
                        request: "pause",
                    }),
                };
                self.respond(reply, result);
            }
            Request::Resume(reply) => {
                let result = match self.run_state {
                    RunState::Paused => self.start(self.current_row),
                    from => Err(BridgeError::InvalidStateTransition {
                        from,
                        request: "resume",
                    }),
                };
                self.respond(reply, result);
            }
            Request::Stop(reply) => {
                let result = match self.run_state {
                    RunState::Running | RunState::Paused => {
                        self.end_session();
                        Ok(())
                    }
                    from => Err(BridgeError::InvalidStateTransition {
                        from,
                        request: "stop",
                    }),
                };
                self.respond(reply, result);
            }
            Request::Unload(reply) => {
                let result = match self.run_state {
                    RunState::Loaded => {
                        info!("treatment unloaded");
                        self.treatment = None;
                        self.current_row = 0;
                        self.run_state = RunState::Idle;
                        Ok(())
                    }
                    from => Err(BridgeError::InvalidStateTransition {
                        from,
                        request: "unload",
                    }),
                };
                self.respond(reply, result);
            }
            Request::Disconnect(reply) => {
                let result = self.disconnect();
                self.respond(reply, result);
            }
            Request::Shutdown => return false,
        }
        true
    }

    // Publishes first so a caller that saw the reply also sees its effect.
    fn respond<T>(&self, reply: Reply<T>, result: Result<T, BridgeError>) {
        self.publish();
        let _ = reply.send(result);
    }

    fn connect(&mut self, port: &str) -> Result<DeviceVariant, BridgeError> {
        if let (Some(current), Some(device)) = (&self.port, &self.device) {
            return if current == port {
                Ok(device.clone())
            } else {
                Err(BridgeError::AlreadyConnected {
                    port: current.clone(),
                })
            };
        }

        info!(port, "connecting");
        let mut link = self.connector.open(port)?;
        let timeout = self.config.handshake_timeout();
        self.active_stage = Some(StageName::Init);
        self.publish();
        let detected = detect(link.as_mut(), self.config.handshake.attempts, timeout);
        self.active_stage = None;
        let device = match detected {
            Ok(device) => device,
            Err(e) => {
                warn!(port, error = %e, "handshake failed");
                self.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        self.link = Some(link);
        self.port = Some(port.to_owned());
        self.device = Some(device.clone());
        self.last_error = None;
        Ok(device)
    }

    fn disconnect(&mut self) -> Result<(), BridgeError> {
        if self.link.is_none() {
            return Err(BridgeError::NotConnected);
        }
        if let from @ (RunState::Running | RunState::Paused | RunState::Stopping) = self.run_state
        {
            return Err(BridgeError::InvalidStateTransition {
                from,
                request: "disconnect",
            });
        }
        info!(port = ?self.port, "disconnected");
        self.drop_connection();
        self.treatment = None;
        self.current_row = 0;
        self.run_state = RunState::Idle;
        Ok(())
    }

    // Replies as soon as the treatment is validated, then runs the store stage.
    fn load(&mut self, treatment: Treatment, reply: Reply) {
        let ops = match self.validate_load(&treatment) {
            Ok(ops) => ops,
            Err(e) => return self.respond(reply, Err(e)),
        };

        info!(name = %treatment.name, rows = treatment.rows.len(), "storing treatment");
        self.treatment = Some(treatment);
        self.current_row = 0;
        self.active_stage = Some(StageName::Store);
        self.respond(reply, Ok(()));

        match self.execute(&ops) {
            Ok(()) => {
                self.active_stage = None;
                self.run_state = RunState::Loaded;
                self.last_error = None;
                info!("treatment loaded");
                self.publish();
            }
            Err(e) => self.fail(e),
        }
    }

    fn validate_load(&self, treatment: &Treatment) -> Result<Vec<Operation>, BridgeError> {
        let from = self.run_state;
        if !matches!(from, RunState::Idle | RunState::Loaded) {
            return Err(BridgeError::InvalidStateTransition {
                from,
                request: "load a treatment",
            });
        }
        let device = self.device.as_ref().ok_or(BridgeError::NotConnected)?;
        if treatment.rows.is_empty() {
            return Err(BridgeError::InvalidTreatment("treatment has no rows".to_owned()));
        }
        let profile = device.profile();
        let args = StageArgs::for_treatment(treatment, self.config.treatment.name_padding);
        instantiate(&profile.commands, &profile.store, &args).map_err(invalid)
    }

    fn start(&mut self, row: usize) -> Result<(), BridgeError> {
        let from = self.run_state;
        if !matches!(from, RunState::Loaded | RunState::Paused) {
            return Err(BridgeError::InvalidStateTransition {
                from,
                request: "start",
            });
        }
        let rows = self.treatment.as_ref().map_or(0, |t| t.rows.len());
        if row >= rows {
            return Err(BridgeError::RowOutOfRange { row, rows });
        }
        info!(row, rows, "playback started");
        self.current_row = row;
        self.run_state = RunState::Running;
        Ok(())
    }

    // Plays the current row, then handles any boundary work. Returns false
    // when the worker should exit.
    fn step(&mut self) -> bool {
        let Some(device) = self.device.clone() else {
            self.fail(BridgeError::NotConnected);
            return true;
        };
        let planned = self.treatment.as_ref().map(|treatment| {
            let profile = device.profile();
            let args = StageArgs::for_treatment(treatment, self.config.treatment.name_padding);
            let ops = instantiate_row(&profile.commands, &profile.playback, &args, self.current_row);
            let dwell = treatment
                .rows
                .get(self.current_row)
                .map_or(Duration::ZERO, |r| Duration::from_millis(r.duration_ms));
            (ops, dwell, treatment.rows.len())
        });
        let Some((ops, dwell, rows)) = planned else {
            self.fail(BridgeError::InvalidTreatment("no treatment loaded".to_owned()));
            return true;
        };
        let ops = match ops {
            Ok(ops) => ops,
            Err(e) => {
                self.fail(invalid(e));
                return true;
            }
        };

        self.active_stage = Some(StageName::Playback);
        self.publish();
        debug!(row = self.current_row, "playing row");
        if let Err(e) = self.execute(&ops) {
            self.fail(e);
            return true;
        }
        if !self.dwell(dwell) {
            return false;
        }

        self.current_row += 1;
        if self.current_row >= rows {
            info!(rows, "playback complete");
            self.active_stage = None;
            self.run_state = RunState::Loaded;
        }
        for control in std::mem::take(&mut self.deferred) {
            match control {
                Control::Stop => self.end_session(),
                Control::Pause if self.run_state == RunState::Running => {
                    info!(row = self.current_row, "playback paused");
                    self.active_stage = None;
                    self.run_state = RunState::Paused;
                }
                Control::Pause => {}
            }
        }
        self.publish();
        true
    }

    // Waits out a row while the device plays it. A first pause while running
    // and a first stop are accepted and applied at the boundary; anything else
    // is rejected. Returns false on shutdown.
    fn dwell(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            match self.requests.recv_timeout(remaining) {
                Ok(Request::Pause(reply))
                    if self.run_state == RunState::Running
                        && !self.deferred.contains(&Control::Pause) =>
                {
                    self.deferred.push(Control::Pause);
                    let _ = reply.send(Ok(()));
                }
                Ok(Request::Stop(reply)) if self.run_state != RunState::Stopping => {
                    self.run_state = RunState::Stopping;
                    self.deferred.push(Control::Stop);
                    self.publish();
                    let _ = reply.send(Ok(()));
                }
                Ok(Request::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
                Ok(other) => other.reject(self.run_state),
                Err(RecvTimeoutError::Timeout) => return true,
            }
        }
    }

    fn execute(&mut self, ops: &[Operation]) -> Result<(), BridgeError> {
        let timeout = match &self.device {
            Some(device) => self.config.read_timeout(device.profile()),
            None => return Err(BridgeError::NotConnected),
        };
        let link = self.link.as_mut().ok_or(BridgeError::NotConnected)?;
        execute_stage(link.as_mut(), ops, timeout)?;
        Ok(())
    }

    // Stage failure: back to IDLE with the error attached. A lost link is
    // dropped; after an echo mismatch the link stays open but the device's
    // stored treatment is unknown.
    fn fail(&mut self, err: BridgeError) {
        warn!(error = %err, row = self.current_row, "stage failed");
        if matches!(&err, BridgeError::Exec(e) if e.is_connection_lost()) {
            self.drop_connection();
        }
        self.treatment = None;
        self.current_row = 0;
        self.run_state = RunState::Idle;
        self.active_stage = None;
        self.last_error = Some(err.to_string());
        self.deferred.clear();
        self.publish();
    }

    fn end_session(&mut self) {
        info!(row = self.current_row, "playback stopped");
        self.treatment = None;
        self.current_row = 0;
        self.run_state = RunState::Idle;
        self.active_stage = None;
    }

    fn drop_connection(&mut self) {
        self.link = None;
        self.port = None;
        self.device = None;
    }

    fn publish(&self) {
        self.status.send_replace(StatusSnapshot {
            connected: self.link.is_some(),
            port: self.port.clone(),
            device: self.device.clone(),
            run_state: self.run_state,
            current_row: self.current_row,
            total_rows: self.treatment.as_ref().map_or(0, |t| t.rows.len()),
            treatment: self.treatment.as_ref().map(|t| t.name.clone()),
            active_stage: self.active_stage,
            last_error: self.last_error.clone(),
        });
    }
}

fn invalid(err: TemplateError) -> BridgeError {
    BridgeError::InvalidTreatment(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Row;
    use crate::registry::DeviceType;
    use crate::sim::{Faults, SimConnector, SimHandle, SimulatedDevice};

    const PORT: &str = "/dev/ttyUSB0";

    fn treatment(rows: usize, duration_ms: u64) -> Treatment {
        Treatment {
            name: "Regenerate".to_owned(),
            rows: (0..rows)
                .map(|i| Row {
                    frequency_hz: 10.0 + i as f64,
                    duration_ms,
                })
                .collect(),
        }
    }

    fn controller() -> (PlaybackController, SimHandle) {
        let mut connector = SimConnector::new();
        let handle = connector.attach(PORT, SimulatedDevice::new(DeviceType::Mr72, "00C0FFEE"));
        let controller = PlaybackController::spawn(connector, BridgeConfig::default()).unwrap();
        (controller, handle)
    }

    async fn wait_for(
        controller: &PlaybackController,
        f: impl FnMut(&StatusSnapshot) -> bool,
    ) -> StatusSnapshot {
        let mut rx = controller.subscribe();
        let status = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
            .await
            .expect("status wait timed out")
            .unwrap()
            .clone();
        status
    }

    #[tokio::test]
    async fn connect_reports_device() {
        let (controller, _handle) = controller();
        let device = controller.connect(PORT).await.unwrap();
        assert_eq!(device.device_type, DeviceType::Mr72);
        assert_eq!(device.serial_number, "00C0FFEE");

        let status = controller.status();
        assert!(status.connected);
        assert_eq!(status.port.as_deref(), Some(PORT));
        assert_eq!(status.run_state, RunState::Idle);

        // Same port is a no-op; another port is refused.
        assert_eq!(controller.connect(PORT).await.unwrap(), device);
        assert!(matches!(
            controller.connect("/dev/ttyUSB1").await,
            Err(BridgeError::AlreadyConnected { .. })
        ));
    }

    #[tokio::test]
    async fn load_stores_the_treatment() {
        let (controller, handle) = controller();
        controller.connect(PORT).await.unwrap();
        controller.load_treatment(treatment(3, 10)).await.unwrap();

        let status = wait_for(&controller, |s| s.run_state == RunState::Loaded).await;
        assert_eq!(status.total_rows, 3);
        assert_eq!(status.current_row, 0);
        assert_eq!(status.treatment.as_deref(), Some("Regenerate"));
        assert_eq!(handle.device().program_size, Some(3));
    }

    #[tokio::test]
    async fn illegal_calls_are_rejected_without_io() {
        let (controller, handle) = controller();
        assert!(matches!(
            controller.load_treatment(treatment(1, 10)).await,
            Err(BridgeError::NotConnected)
        ));
        controller.connect(PORT).await.unwrap();
        handle.clear_capture();

        for result in [
            controller.start(0).await,
            controller.pause().await,
            controller.resume().await,
            controller.stop().await,
            controller.unload().await,
        ] {
            assert!(matches!(
                result,
                Err(BridgeError::InvalidStateTransition {
                    from: RunState::Idle,
                    ..
                })
            ));
        }
        assert!(matches!(
            controller.load_treatment(treatment(0, 10)).await,
            Err(BridgeError::InvalidTreatment(_))
        ));
        assert!(handle.capture().is_empty());
    }

    #[tokio::test]
    async fn start_rejects_rows_past_the_end() {
        let (controller, _handle) = controller();
        controller.connect(PORT).await.unwrap();
        controller.load_treatment(treatment(2, 10)).await.unwrap();
        assert!(matches!(
            controller.start(2).await,
            Err(BridgeError::RowOutOfRange { row: 2, rows: 2 })
        ));
    }

    #[tokio::test]
    async fn playback_runs_to_completion() {
        let (controller, handle) = controller();
        controller.connect(PORT).await.unwrap();
        controller.load_treatment(treatment(3, 5)).await.unwrap();
        controller.start(0).await.unwrap();

        let status = wait_for(&controller, |s| {
            s.run_state == RunState::Loaded && s.current_row == 3
        })
        .await;
        assert_eq!(status.active_stage, None);
        assert_eq!(handle.device().runs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn pause_waits_for_row_boundary_then_resumes() {
        let (controller, handle) = controller();
        controller.connect(PORT).await.unwrap();
        controller.load_treatment(treatment(3, 150)).await.unwrap();
        controller.start(0).await.unwrap();
        controller.pause().await.unwrap();

        let status = wait_for(&controller, |s| s.run_state == RunState::Paused).await;
        assert_eq!(status.current_row, 1);
        assert_eq!(handle.device().runs, vec![0]);

        // Only pause/stop are accepted while paused or running.
        assert!(matches!(
            controller.unload().await,
            Err(BridgeError::InvalidStateTransition { .. })
        ));

        controller.resume().await.unwrap();
        wait_for(&controller, |s| {
            s.run_state == RunState::Loaded && s.current_row == 3
        })
        .await;
        assert_eq!(handle.device().runs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn pause_between_rows_clears_the_stage() {
        let (controller, _handle) = controller();
        controller.connect(PORT).await.unwrap();
        controller.load_treatment(treatment(1000, 0)).await.unwrap();
        controller.start(0).await.unwrap();
        controller.pause().await.unwrap();

        let status = wait_for(&controller, |s| s.run_state == RunState::Paused).await;
        assert!(status.current_row < 1000);
        assert_eq!(status.active_stage, None);
        assert_eq!(controller.status().active_stage, None);
    }

    #[tokio::test]
    async fn only_one_pause_or_stop_is_taken_per_row() {
        let (controller, _handle) = controller();
        controller.connect(PORT).await.unwrap();
        controller.load_treatment(treatment(3, 400)).await.unwrap();
        controller.start(0).await.unwrap();
        wait_for(&controller, |s| s.active_stage == Some(StageName::Playback)).await;
        controller.pause().await.unwrap();
        assert!(matches!(
            controller.pause().await,
            Err(BridgeError::InvalidStateTransition {
                from: RunState::Running,
                ..
            })
        ));

        controller.stop().await.unwrap();
        assert_eq!(controller.status().run_state, RunState::Stopping);
        for result in [controller.pause().await, controller.stop().await] {
            assert!(matches!(
                result,
                Err(BridgeError::InvalidStateTransition {
                    from: RunState::Stopping,
                    ..
                })
            ));
        }

        let status = wait_for(&controller, |s| s.run_state == RunState::Idle).await;
        assert_eq!(status.treatment, None);
    }

    #[tokio::test]
    async fn failed_handshake_is_reported_in_status() {
        let mut connector = SimConnector::new();
        connector.attach(
            PORT,
            SimulatedDevice::new(DeviceType::Mr72, "12345678").with_faults(Faults {
                signature_override: Some(b'Z'),
                ..Faults::default()
            }),
        );
        let controller = PlaybackController::spawn(connector, BridgeConfig::default()).unwrap();

        assert!(matches!(
            controller.connect(PORT).await,
            Err(BridgeError::Detection(_))
        ));
        let status = controller.status();
        assert!(!status.connected);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn stop_returns_to_idle() {
        let (controller, handle) = controller();
        controller.connect(PORT).await.unwrap();
        controller.load_treatment(treatment(5, 100)).await.unwrap();
        controller.start(1).await.unwrap();
        controller.stop().await.unwrap();

        let status = wait_for(&controller, |s| s.run_state == RunState::Idle).await;
        assert!(status.connected);
        assert_eq!(status.treatment, None);
        assert_eq!(handle.device().runs, vec![1]);
    }

    #[tokio::test]
    async fn lost_connection_drops_to_idle() {
        let (controller, handle) = controller();
        controller.connect(PORT).await.unwrap();
        controller.load_treatment(treatment(2, 10)).await.unwrap();
        wait_for(&controller, |s| s.run_state == RunState::Loaded).await;

        handle.set_faults(Faults {
            silent_after: Some(0),
            ..Faults::default()
        });
        controller.start(0).await.unwrap();

        let status = wait_for(&controller, |s| s.run_state == RunState::Idle).await;
        assert!(!status.connected);
        assert_eq!(status.device, None);
        assert!(status.last_error.unwrap().contains("connection lost"));

        // No reconnect happens on its own.
        assert!(matches!(
            controller.load_treatment(treatment(1, 10)).await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn echo_mismatch_keeps_the_link() {
        let (controller, handle) = controller();
        controller.connect(PORT).await.unwrap();
        // The handshake wrote two bytes; the third write is the 'I' command.
        handle.set_faults(Faults {
            corrupt_echo_at: Some(2),
            ..Faults::default()
        });
        controller.load_treatment(treatment(2, 10)).await.unwrap();

        let status = wait_for(&controller, |s| s.last_error.is_some()).await;
        assert_eq!(status.run_state, RunState::Idle);
        assert!(status.connected);
        assert!(status.last_error.unwrap().contains("echo mismatch"));
    }

    #[tokio::test]
    async fn disconnect_releases_the_port() {
        let (controller, _handle) = controller();
        assert!(matches!(
            controller.disconnect().await,
            Err(BridgeError::NotConnected)
        ));
        controller.connect(PORT).await.unwrap();
        controller.disconnect().await.unwrap();
        assert!(!controller.status().connected);
        controller.connect(PORT).await.unwrap();
    }
}
