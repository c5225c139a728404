//! # Link Manager
//!
//! Connection state machine and ingestion driver.
//!
//! Every command is queued onto one worker task, which owns the transport,
//! the [`PacketDecoder`] and the [`TelemetryAggregator`]. State changes, decoded
//! records and failures are published as [`LinkEvent`]s in the order they
//! happen. Callers never touch that state directly: they read the `watch`
//! snapshots the worker publishes after each update.
//!
//! ## Drops
//!
//! A read error, a hang-up or silence longer than the heartbeat timeout
//! moves the link to `Error` and straight back to `Idle`. The logging gate
//! closes, the transport is released once, and the open segment is kept so
//! a fresh `connect()` + `start_logging()` continues it.
//!
//! ## Storage
//!
//! The worker never waits for the store. Rows and segment snapshots are
//! handed to the [`IngestWriter`], which persists them on its own task.

use std::future::pending;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::bus::{EventBus, EventStream};
use super::event::{ErrorKind, LinkEvent};
use super::state::LinkState;
use crate::config::Config;
use crate::error::{Result, RoadsenseError};
use crate::ingest::aggregator::{TelemetryAggregator, TelemetrySnapshot};
use crate::ingest::sink::IngestionSink;
use crate::ingest::writer::{IngestWriter, WriterConfig};
use crate::model::RoadSegment;
use crate::protocol::decoder::PacketDecoder;
use crate::protocol::encoder::encode_command;
use crate::protocol::packet::{DecodedFrame, DeviceCommand};
use crate::transport::{Connector, DeviceCandidate, LinkTransport};

/// Queued commands waiting for the worker
const COMMAND_QUEUE: usize = 32;

/// Lower bound for the liveness check period
const MIN_HEARTBEAT_CHECK: Duration = Duration::from_millis(10);

/// Runtime settings for the link worker
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a connect attempt may look for a device
    pub discovery_timeout: Duration,
    /// Pause between discovery passes
    pub discovery_poll: Duration,
    /// Silence on the link after which it counts as dropped
    pub heartbeat_timeout: Duration,
    pub read_buffer_size: usize,
    pub max_line_length: usize,
    /// Upper bound on how long rows wait in the batch buffer
    pub flush_interval: Duration,
    /// Events a subscriber may fall behind before it is disconnected
    pub event_capacity: usize,
    pub writer: WriterConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(10),
            discovery_poll: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_secs(5),
            read_buffer_size: 512,
            max_line_length: crate::protocol::packet::DEFAULT_MAX_LINE_LENGTH,
            flush_interval: Duration::from_millis(500),
            event_capacity: 1024,
            writer: WriterConfig::default(),
        }
    }
}

impl From<&Config> for ManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            discovery_timeout: Duration::from_millis(config.link.discovery_timeout_ms),
            discovery_poll: Duration::from_millis(config.link.discovery_poll_ms),
            heartbeat_timeout: Duration::from_millis(config.link.heartbeat_timeout_ms),
            read_buffer_size: config.link.read_buffer_size,
            max_line_length: config.decoder.max_line_length,
            flush_interval: Duration::from_millis(config.ingest.flush_interval_ms),
            event_capacity: config.ingest.event_capacity,
            writer: WriterConfig {
                batch_size: config.ingest.batch_size,
                max_pending_batches: config.ingest.max_pending_batches,
            },
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect(Reply<Result<()>>),
    Disconnect(Reply<Result<()>>),
    StartLogging(Reply<Result<()>>),
    PauseLogging(Reply<Result<()>>),
    StopLogging(Reply<Result<()>>),
    ResetTrip(Reply<Result<()>>),
    OpenSegment(RoadSegment, Reply<Result<()>>),
    CloseSegment(Reply<Option<RoadSegment>>),
    Subscribe(Reply<EventStream>),
    Cleanup(Reply<Result<()>>),
}

/// Progress reported by a running connect attempt
enum ConnectProgress {
    Found,
    Opened(DeviceCandidate, Box<dyn LinkTransport>),
    Failed(ErrorKind, String),
}

/// Handle to the link worker
///
/// Cloning is cheap; all clones drive the same worker.
#[derive(Clone)]
pub struct LinkManager {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LinkState>,
    telemetry: watch::Receiver<TelemetrySnapshot>,
}

impl LinkManager {
    /// Start the worker task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        connector: Arc<dyn Connector>,
        sink: Arc<dyn IngestionSink>,
        config: ManagerConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state) = watch::channel(LinkState::Idle);
        let (telemetry_tx, telemetry) = watch::channel(TelemetrySnapshot::default());
        let events = EventBus::new(config.event_capacity);
        let (progress_tx, progress_rx) = mpsc::channel(4);

        let worker = Worker {
            connector,
            state: LinkState::Idle,
            state_tx,
            telemetry_tx,
            decoder: PacketDecoder::new(config.max_line_length),
            aggregator: TelemetryAggregator::new(),
            writer: IngestWriter::spawn(sink, config.writer, events.clone()),
            events,
            transport: None,
            device_name: None,
            connect_task: None,
            attempt: 0,
            progress_tx,
            progress_rx,
            last_activity: Instant::now(),
            last_heartbeat_check: Instant::now(),
            read_buf: vec![0u8; config.read_buffer_size.max(1)],
            config,
        };
        tokio::spawn(worker.run(command_rx));

        Self {
            commands,
            state,
            telemetry,
        }
    }

    /// Start discovery and connect to the first device found
    ///
    /// Returns once the attempt has started; progress is reported through
    /// events and [`state`](Self::state). A no-op while already connected.
    ///
    /// # Errors
    ///
    /// `AlreadyConnecting` if an attempt is running.
    pub async fn connect(&self) -> Result<()> {
        self.call(Command::Connect).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.call(Command::Disconnect).await?
    }

    /// Open the acceptance gate (`Connected -> Streaming`)
    pub async fn start_logging(&self) -> Result<()> {
        self.call(Command::StartLogging).await?
    }

    /// Close the acceptance gate, keeping the link (`Streaming -> Connected`)
    pub async fn pause_logging(&self) -> Result<()> {
        self.call(Command::PauseLogging).await?
    }

    /// Pause and complete the open segment
    pub async fn stop_logging(&self) -> Result<()> {
        self.call(Command::StopLogging).await?
    }

    /// Zero the trip accumulator
    pub async fn reset_trip(&self) -> Result<()> {
        self.call(Command::ResetTrip).await?
    }

    /// Persist `segment` and make it the target for new records
    ///
    /// # Errors
    ///
    /// `InvalidStationFormat` if the segment's start station does not parse.
    pub async fn open_segment(&self, segment: RoadSegment) -> Result<()> {
        self.call(|reply| Command::OpenSegment(segment, reply)).await?
    }

    /// Complete the open segment whatever the link state
    ///
    /// Returns the completed snapshot, or `None` if no segment was open.
    pub async fn close_segment(&self) -> Result<Option<RoadSegment>> {
        self.call(Command::CloseSegment).await
    }

    /// Receive every event published from now on
    ///
    /// A subscriber that falls `event_capacity` events behind is
    /// disconnected; its stream then ends with
    /// [`StreamEnd::Overflowed`](super::bus::StreamEnd::Overflowed).
    pub async fn subscribe(&self) -> Result<EventStream> {
        self.call(Command::Subscribe).await
    }

    /// Release the link, drain pending writes and stop the worker
    ///
    /// Subscribers see their stream close afterwards. Calling it again is a
    /// no-op.
    pub async fn cleanup(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Cleanup(reply)).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Current connection state
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Latest telemetry snapshot
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.borrow().clone()
    }

    /// Watch connection state changes
    pub fn state_watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Watch telemetry snapshots
    pub fn telemetry_watch(&self) -> watch::Receiver<TelemetrySnapshot> {
        self.telemetry.clone()
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| RoadsenseError::ManagerClosed)?;
        rx.await.map_err(|_| RoadsenseError::ManagerClosed)
    }
}

struct Worker {
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    state: LinkState,
    state_tx: watch::Sender<LinkState>,
    telemetry_tx: watch::Sender<TelemetrySnapshot>,
    events: EventBus,
    decoder: PacketDecoder,
    aggregator: TelemetryAggregator,
    writer: IngestWriter,
    transport: Option<Box<dyn LinkTransport>>,
    device_name: Option<String>,
    connect_task: Option<JoinHandle<()>>,
    /// Bumped per connect attempt; progress from older attempts is ignored
    attempt: u64,
    progress_tx: mpsc::Sender<(u64, ConnectProgress)>,
    progress_rx: mpsc::Receiver<(u64, ConnectProgress)>,
    last_activity: Instant,
    last_heartbeat_check: Instant,
    read_buf: Vec<u8>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut heartbeat = interval((self.config.heartbeat_timeout / 4).max(MIN_HEARTBEAT_CHECK));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flush = interval(self.config.flush_interval.max(MIN_HEARTBEAT_CHECK));
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let cleanup_reply = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Cleanup(reply)) => break Some(reply),
                    Some(command) => self.handle(command).await,
                    None => break None,
                },
                Some((attempt, progress)) = self.progress_rx.recv() => {
                    self.on_connect_progress(attempt, progress).await;
                }
                read = read_from(&mut self.transport, &mut self.read_buf) => {
                    self.on_read(read).await;
                }
                _ = heartbeat.tick() => self.check_heartbeat().await,
                _ = flush.tick() => self.flush_progress(),
            }
        };

        // Refuse commands queued behind cleanup
        drop(commands);
        self.shutdown().await;
        if let Some(reply) = cleanup_reply {
            let _ = reply.send(Ok(()));
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let _ = reply.send(self.connect());
            }
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            }
            Command::StartLogging(reply) => {
                let result = self.start_logging().await;
                let _ = reply.send(result);
            }
            Command::PauseLogging(reply) => {
                let result = self.pause_logging().await;
                let _ = reply.send(result);
            }
            Command::StopLogging(reply) => {
                let result = self.stop_logging().await;
                let _ = reply.send(result);
            }
            Command::ResetTrip(reply) => {
                self.aggregator.reset_trip();
                self.publish_telemetry();
                let _ = reply.send(Ok(()));
            }
            Command::OpenSegment(segment, reply) => {
                let result = self.open_segment(segment);
                let _ = reply.send(result);
            }
            Command::CloseSegment(reply) => {
                let completed = self.close_segment();
                let _ = reply.send(completed);
            }
            Command::Subscribe(reply) => {
                let _ = reply.send(self.events.subscribe());
            }
            Command::Cleanup(reply) => {
                // Handled by the run loop
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.state.is_connecting() {
            return Err(RoadsenseError::AlreadyConnecting);
        }
        if !self.state.can_connect() {
            debug!("connect() ignored in state {}", self.state);
            return Ok(());
        }

        self.attempt += 1;
        self.transition(LinkState::Scanning);

        let task = tokio::spawn(run_connect(
            self.connector.clone(),
            self.attempt,
            self.config.discovery_timeout,
            self.config.discovery_poll,
            self.progress_tx.clone(),
        ));
        self.connect_task = Some(task);
        Ok(())
    }

    async fn on_connect_progress(&mut self, attempt: u64, progress: ConnectProgress) {
        if attempt != self.attempt || !self.state.is_connecting() {
            if let ConnectProgress::Opened(device, mut transport) = progress {
                debug!("Closing link to {} from an abandoned attempt", device.name);
                let _ = transport.close().await;
            }
            return;
        }

        match progress {
            ConnectProgress::Found => self.transition(LinkState::Connecting),
            ConnectProgress::Opened(device, transport) => {
                self.connect_task = None;
                self.transport = Some(transport);
                self.decoder.reset();
                self.last_activity = Instant::now();
                self.transition(LinkState::Connected);

                info!("Connected to {} at {}", device.name, device.address);
                self.device_name = Some(device.name.clone());
                self.emit(LinkEvent::DeviceConnected(device.name));
            }
            ConnectProgress::Failed(kind, message) => {
                self.connect_task = None;
                warn!("Connect attempt failed: {}", message);
                self.transition(LinkState::Error);
                self.emit(LinkEvent::error(kind, message));
                self.transition(LinkState::Idle);
            }
        }
    }

    async fn on_read(&mut self, read: io::Result<usize>) {
        let n = match read {
            Ok(0) => {
                self.link_lost(ErrorKind::ConnectionLost, "device closed the link".to_string())
                    .await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                self.link_lost(ErrorKind::ConnectionLost, format!("read failed: {}", e))
                    .await;
                return;
            }
        };

        self.last_activity = Instant::now();
        self.decoder.push(&self.read_buf[..n]);

        while let Some(frame) = self.decoder.next_frame() {
            self.on_frame(frame);
        }
        self.publish_telemetry();
    }

    fn on_frame(&mut self, frame: DecodedFrame) {
        match frame {
            DecodedFrame::Telemetry(raw) => {
                self.aggregator.observe(&raw);
                if let Some(record) = self.aggregator.on_record(&raw, Utc::now()) {
                    self.writer.push(record.clone());
                    self.emit(LinkEvent::RecordReceived(record));
                }
            }
            DecodedFrame::Message(text) => {
                info!("Device: {}", text);
                self.emit(LinkEvent::MessageReceived(text));
            }
            DecodedFrame::Heartbeat => {}
            DecodedFrame::Overflow { discarded } => {
                self.emit(LinkEvent::error(
                    ErrorKind::FrameOverflow,
                    format!("discarded {} bytes without line terminator", discarded),
                ));
            }
        }
    }

    async fn check_heartbeat(&mut self) {
        let since_check = self.last_heartbeat_check.elapsed();
        self.last_heartbeat_check = Instant::now();
        if !self.state.is_connected() {
            return;
        }
        // A late check means this task was held up, not the device
        if since_check > self.config.heartbeat_timeout {
            debug!("Heartbeat check ran {} ms late", since_check.as_millis());
            self.last_activity = Instant::now();
            return;
        }
        let silent = self.last_activity.elapsed();
        if silent > self.config.heartbeat_timeout {
            self.link_lost(
                ErrorKind::ConnectionLost,
                format!("no data for {} ms", silent.as_millis()),
            )
            .await;
        }
    }

    /// Persist pending rows, followed by a length update if one is due
    fn flush_progress(&mut self) {
        match self.aggregator.take_progress() {
            Some(segment) => {
                self.writer.record_progress(segment.clone());
                self.emit(LinkEvent::SegmentUpdated(segment));
            }
            None => self.writer.flush(),
        }
    }

    async fn start_logging(&mut self) -> Result<()> {
        match self.state {
            LinkState::Connected => {}
            LinkState::Streaming => return Ok(()),
            other => {
                debug!("start_logging() ignored in state {}", other);
                return Ok(());
            }
        }

        self.send_command(DeviceCommand::Start).await?;
        self.aggregator.set_logging(true);
        self.transition(LinkState::Streaming);
        self.publish_telemetry();
        Ok(())
    }

    async fn pause_logging(&mut self) -> Result<()> {
        if !self.state.is_streaming() {
            debug!("pause_logging() ignored in state {}", self.state);
            return Ok(());
        }

        self.send_command(DeviceCommand::Pause).await?;
        self.aggregator.set_logging(false);
        self.transition(LinkState::Connected);
        self.publish_telemetry();
        Ok(())
    }

    async fn stop_logging(&mut self) -> Result<()> {
        if !self.state.is_connected() {
            debug!("stop_logging() ignored in state {}", self.state);
            return Ok(());
        }

        // The segment ends even if the device never hears STOP
        let sent = self.send_command(DeviceCommand::Stop).await;
        self.aggregator.set_logging(false);
        if sent.is_ok() {
            self.transition(LinkState::Connected);
        }
        self.close_segment();
        sent
    }

    fn open_segment(&mut self, segment: RoadSegment) -> Result<()> {
        self.flush_progress();
        self.aggregator.open_segment(segment.clone())?;
        self.writer.create_segment(segment);
        self.publish_telemetry();
        Ok(())
    }

    fn close_segment(&mut self) -> Option<RoadSegment> {
        let completed = self.aggregator.end_segment(Utc::now())?;
        self.writer.update_segment(completed.clone());
        self.emit(LinkEvent::SegmentUpdated(completed.clone()));
        self.publish_telemetry();
        Some(completed)
    }

    async fn send_command(&mut self, command: DeviceCommand) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(RoadsenseError::Serial("no open link".to_string()));
        };

        let line = encode_command(command);
        let written = match transport.write_all(&line).await {
            Ok(()) => transport.flush().await,
            Err(e) => Err(e),
        };

        if let Err(e) = written {
            let message = format!("failed to send {}: {}", command.keyword(), e);
            self.link_lost(ErrorKind::Write, message.clone()).await;
            return Err(RoadsenseError::Serial(message));
        }

        debug!("Sent {} to device", command.keyword());
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.state == LinkState::Idle {
            return;
        }

        self.abandon_attempt();
        self.aggregator.set_logging(false);
        self.transition(LinkState::Disconnecting);
        self.release_transport().await;
        self.writer.flush();
        self.transition(LinkState::Idle);
        self.publish_telemetry();
    }

    async fn link_lost(&mut self, kind: ErrorKind, reason: String) {
        warn!("Link lost: {}", reason);

        self.aggregator.set_logging(false);
        self.release_transport().await;
        self.writer.flush();

        self.transition(LinkState::Error);
        self.emit(LinkEvent::error(kind, reason));
        self.transition(LinkState::Idle);
        self.publish_telemetry();
    }

    fn abandon_attempt(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.attempt += 1;
    }

    async fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                debug!("Error closing link: {}", e);
            }
            if let Some(name) = self.device_name.take() {
                info!("Released link to {}", name);
            }
        }
    }

    async fn shutdown(mut self) {
        info!("Link manager shutting down");
        self.disconnect().await;
        self.flush_progress();
        self.writer.shutdown().await;
        self.events.close();
    }

    fn transition(&mut self, next: LinkState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!("Ignoring illegal transition {} -> {}", self.state, next);
            return;
        }

        info!("Link state: {} -> {}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(LinkEvent::StateChanged(next));
    }

    fn emit(&self, event: LinkEvent) {
        self.events.publish(event);
    }

    fn publish_telemetry(&self) {
        let mut snapshot = self.aggregator.snapshot().clone();
        snapshot.decoder = self.decoder.stats();
        self.telemetry_tx.send_replace(snapshot);
    }
}

/// Read from the transport, or wait forever when there is none
async fn read_from(
    transport: &mut Option<Box<dyn LinkTransport>>,
    buf: &mut [u8],
) -> io::Result<usize> {
    match transport {
        Some(transport) => transport.read_chunk(buf).await,
        None => pending().await,
    }
}

async fn run_connect(
    connector: Arc<dyn Connector>,
    attempt: u64,
    discovery_timeout: Duration,
    poll: Duration,
    progress: mpsc::Sender<(u64, ConnectProgress)>,
) {
    let deadline = Instant::now() + discovery_timeout;

    let device = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, connector.discover()).await {
            Ok(Ok(Some(device))) => break device,
            Ok(Ok(None)) => {}
            Ok(Err(e)) => debug!("Discovery pass failed: {}", e),
            Err(_) => debug!("Discovery pass still running at the deadline"),
        }

        if Instant::now() + poll >= deadline {
            let error = RoadsenseError::DeviceNotFound(format!(
                "nothing within {} ms",
                discovery_timeout.as_millis()
            ));
            let _ = progress
                .send((attempt, ConnectProgress::Failed(ErrorKind::Discovery, error.to_string())))
                .await;
            return;
        }
        sleep(poll).await;
    };

    info!("Found {} at {}", device.name, device.address);
    let _ = progress.send((attempt, ConnectProgress::Found)).await;

    let outcome = match timeout(discovery_timeout, connector.open(&device)).await {
        Ok(Ok(transport)) => ConnectProgress::Opened(device, transport),
        Ok(Err(e)) => ConnectProgress::Failed(ErrorKind::Connect, e.to_string()),
        Err(_) => ConnectProgress::Failed(
            ErrorKind::Connect,
            format!("opening {} timed out", device.address),
        ),
    };
    let _ = progress.send((attempt, outcome)).await;
}
