//! # Multi-Protocol Frame Parser
//!
//! `MultiProtocolFrameParser` connects to a phasor source described by a connection
//! string, reassembles frames from the byte stream, decodes them with the codec of the
//! configured protocol and hands the results out as [`ParserEvent`]s.
//!
//! ## Threading
//!
//! Each started parser owns one worker thread. The worker blocks on transport reads
//! with a short timeout so `stop()` is observed promptly, and pushes events into a
//! bounded channel. A full channel stalls the worker, which throttles the source.
//!
//! ## Lifecycle
//!
//! `Disconnected -> Connecting -> Connected -> Disconnected`. Transport failures are
//! retried after `reconnectDelay`; tripping the parsing exception breaker ends the
//! connection for good.

pub mod assembler;
mod breaker;
mod connection_string;
mod settings;
pub mod transport;

pub use breaker::ExceptionWindow;
pub use connection_string::ConnectionString;
pub use settings::{
    ChecksumValidation, ParserSettings, SerialParity, TransportSettings,
    DEFAULT_ACCESS_ID, DEFAULT_ALLOWED_PARSING_EXCEPTIONS, DEFAULT_DEFINED_FRAME_RATE,
    DEFAULT_PARSING_EXCEPTION_WINDOW,
};

use crate::codec::{
    codec_for, CodecError, ConfigurationKind, DecodedFrame, DeviceCommand, FrameKind,
    PhasorProtocol, ProtocolCodec,
};
use crate::measurement::utc_now_ticks;
use crate::model::{ConfigurationFrame, Frame};
use assembler::FrameAssembler;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use transport::Transport;

const STOP_POLL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 16_384;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("invalid value '{value}' for setting '{key}'")]
    InvalidSetting { key: String, value: String },
    #[error("missing required setting '{0}'")]
    MissingSetting(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParserEvent {
    ConnectionAttempt {
        attempt: u32,
    },
    ConnectionEstablished,
    ConnectionException {
        error: String,
        attempt: u32,
    },
    ConnectionTerminated,
    ConfigurationFrameReceived(ConfigurationKind, ConfigurationFrame),
    DataFrameReceived(Frame),
    HeaderFrameReceived {
        id_code: u16,
        text: String,
    },
    CommandFrameReceived {
        id_code: u16,
        command: DeviceCommand,
    },
    /// Raw bytes of every complete frame, before decoding.
    ReceivedFrameBufferImage {
        kind: FrameKind,
        bytes: Vec<u8>,
    },
    ParsingException(String),
    ExceededParsingExceptionThreshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParserState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserStatistics {
    pub total_bytes_received: u64,
    pub total_frames: u64,
    pub configuration_frames: u64,
    pub data_frames: u64,
    pub header_frames: u64,
    pub command_frames: u64,
    pub parsing_exceptions: u64,
    pub connection_attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes: AtomicU64,
    frames: AtomicU64,
    configuration: AtomicU64,
    data: AtomicU64,
    header: AtomicU64,
    command: AtomicU64,
    exceptions: AtomicU64,
    attempts: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ParserStatistics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ParserStatistics {
            total_bytes_received: load(&self.bytes),
            total_frames: load(&self.frames),
            configuration_frames: load(&self.configuration),
            data_frames: load(&self.data),
            header_frames: load(&self.header),
            command_frames: load(&self.command),
            parsing_exceptions: load(&self.exceptions),
            connection_attempts: load(&self.attempts),
        }
    }
}

struct Shared {
    running: AtomicBool,
    state: Mutex<ParserState>,
    counters: Counters,
}

impl Shared {
    fn set_state(&self, state: ParserState) {
        *self.state.lock() = state;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleeps up to `duration`, waking early when the parser stops.
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while self.is_running() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }
}

pub struct MultiProtocolFrameParser {
    settings: ParserSettings,
    codec: Arc<dyn ProtocolCodec>,
    shared: Arc<Shared>,
    events: SyncSender<ParserEvent>,
    commands: Sender<DeviceCommand>,
    /// The command queue's receiving end while no worker holds it.
    pending: Mutex<Option<Receiver<DeviceCommand>>>,
    worker: Mutex<Option<JoinHandle<Receiver<DeviceCommand>>>>,
}

impl MultiProtocolFrameParser {
    /// Parses `connection_string` and creates a stopped parser with its event receiver.
    pub fn initialize(
        connection_string: &str,
    ) -> Result<(Self, Receiver<ParserEvent>), ParserError> {
        let settings = ParserSettings::from_connection_string(connection_string)?;
        Self::new(settings)
    }

    pub fn new(settings: ParserSettings) -> Result<(Self, Receiver<ParserEvent>), ParserError> {
        settings.validate()?;
        let (events, receiver) = mpsc::sync_channel(settings.event_queue_size);
        let (commands, pending) = mpsc::channel();
        let codec = codec_for(settings.phasor_protocol);

        Ok((
            MultiProtocolFrameParser {
                settings,
                codec,
                shared: Arc::new(Shared {
                    running: AtomicBool::new(false),
                    state: Mutex::new(ParserState::Disconnected),
                    counters: Counters::default(),
                }),
                events,
                commands,
                pending: Mutex::new(Some(pending)),
                worker: Mutex::new(None),
            },
            receiver,
        ))
    }

    pub fn settings(&self) -> &ParserSettings {
        &self.settings
    }

    pub fn state(&self) -> ParserState {
        *self.shared.state.lock()
    }

    pub fn statistics(&self) -> ParserStatistics {
        self.shared.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Spawns the worker. Does nothing if the parser is already running.
    pub fn start(&self) -> Result<(), ParserError> {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            if !handle.is_finished() {
                *worker = Some(handle);
                return Ok(());
            }
            // The previous session ended on its own; reclaim its command queue.
            if let Ok(commands) = handle.join() {
                *self.pending.lock() = Some(commands);
            }
        }
        let commands = match self.pending.lock().take() {
            Some(commands) => commands,
            None => return Ok(()),
        };

        self.shared.running.store(true, Ordering::SeqCst);
        let session = Worker {
            settings: self.settings.clone(),
            codec: Arc::clone(&self.codec),
            shared: Arc::clone(&self.shared),
            events: self.events.clone(),
            commands,
            configuration: None,
            breaker: ExceptionWindow::new(
                self.settings.allowed_parsing_exceptions,
                self.settings.parsing_exception_window,
            ),
            outbox: Vec::new(),
            enable_sent: false,
            next_playback_frame: None,
        };

        info!(
            "Starting {} parser on {}",
            self.settings.phasor_protocol, self.settings.transport
        );
        let spawned = thread::Builder::new()
            .name(format!("parser-{}", self.settings.phasor_protocol))
            .spawn(move || session.run());
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Stops the worker and waits for it to close its transport. Safe to call more than once.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            match handle.join() {
                Ok(commands) => *self.pending.lock() = Some(commands),
                Err(_) => error!("Parser worker panicked"),
            }
        }
        self.shared.set_state(ParserState::Disconnected);
    }

    /// Queues `command` for the device. It is written on the next pass of the read loop.
    pub fn send_command(&self, command: DeviceCommand) {
        // The receiver lives as long as the parser, so sending cannot fail.
        let _ = self.commands.send(command);
    }
}

impl Drop for MultiProtocolFrameParser {
    fn drop(&mut self) {
        self.stop();
    }
}

enum SessionEnd {
    Stopped,
    /// The source ended and will not be replayed.
    Completed,
    Tripped,
    Failed(String),
}

struct Worker {
    settings: ParserSettings,
    codec: Arc<dyn ProtocolCodec>,
    shared: Arc<Shared>,
    events: SyncSender<ParserEvent>,
    commands: Receiver<DeviceCommand>,
    configuration: Option<ConfigurationFrame>,
    breaker: ExceptionWindow,
    /// Commands raised while decoding, written after the current read.
    outbox: Vec<DeviceCommand>,
    enable_sent: bool,
    next_playback_frame: Option<Instant>,
}

impl Worker {
    fn run(mut self) -> Receiver<DeviceCommand> {
        let max_attempts = self.settings.maximum_connection_attempts;
        let mut attempt = 0u32;

        while self.shared.is_running() {
            attempt += 1;
            Counters::bump(&self.shared.counters.attempts, 1);
            self.shared.set_state(ParserState::Connecting);
            self.emit(ParserEvent::ConnectionAttempt { attempt });

            let failure = match self.connect() {
                Ok((mut transport, mut command_channel)) => {
                    info!("Connected to {}", transport.description());
                    self.shared.set_state(ParserState::Connected);
                    self.emit(ParserEvent::ConnectionEstablished);

                    let end = self.session(transport.as_mut(), command_channel.as_mut().map(|c| c.as_mut() as &mut dyn Transport));
                    match end {
                        SessionEnd::Stopped => break,
                        SessionEnd::Completed => {
                            info!("Source {} ended", transport.description());
                            self.emit(ParserEvent::ConnectionTerminated);
                            break;
                        }
                        SessionEnd::Tripped => {
                            self.emit(ParserEvent::ConnectionTerminated);
                            break;
                        }
                        SessionEnd::Failed(error) => {
                            // A session that got going restarts the attempt count.
                            let failed_attempt = attempt;
                            attempt = 0;
                            (error, failed_attempt)
                        }
                    }
                }
                Err(e) => (e.to_string(), attempt),
            };

            let (error, failed_attempt) = failure;
            warn!("Connection attempt {} failed: {}", failed_attempt, error);
            self.shared.set_state(ParserState::Disconnected);
            self.emit(ParserEvent::ConnectionException {
                error,
                attempt: failed_attempt,
            });

            if max_attempts > 0 && attempt >= max_attempts as u32 {
                warn!("Giving up after {} connection attempts", attempt);
                self.emit(ParserEvent::ConnectionTerminated);
                break;
            }
            self.shared
                .sleep(Duration::from_secs_f64(self.settings.reconnect_delay));
        }

        self.shared.set_state(ParserState::Disconnected);
        self.shared.running.store(false, Ordering::SeqCst);
        debug!("Parser worker exiting");
        self.commands
    }

    #[allow(clippy::type_complexity)]
    fn connect(&self) -> Result<(Box<dyn Transport>, Option<Box<dyn Transport>>), ParserError> {
        let data = transport::open(&self.settings.transport)?;
        let command = self
            .settings
            .command_channel
            .as_ref()
            .map(transport::open)
            .transpose()?;
        Ok((data, command))
    }

    fn session(
        &mut self,
        data: &mut dyn Transport,
        mut command_channel: Option<&mut dyn Transport>,
    ) -> SessionEnd {
        self.configuration = None;
        self.enable_sent = false;
        self.breaker.reset();
        self.next_playback_frame = None;

        let mut data_frames = FrameAssembler::new(self.settings.buffer_size);
        let mut command_frames = FrameAssembler::new(self.settings.buffer_size);
        let mut buf = vec![0u8; READ_CHUNK.min(self.settings.buffer_size)];

        if self.settings.auto_start_data_parsing_sequence {
            let iec = self.settings.phasor_protocol == PhasorProtocol::Iec61850_90_5;
            if !self.settings.skip_disable_real_time_data && !iec {
                self.outbox.push(DeviceCommand::DisableRealTimeData);
            }
            self.outbox.push(DeviceCommand::SendConfigurationFrame2);
        }

        loop {
            if !self.shared.is_running() {
                return SessionEnd::Stopped;
            }

            self.outbox.extend(self.commands.try_iter());
            for command in std::mem::take(&mut self.outbox) {
                let target: &mut dyn Transport = match command_channel.as_deref_mut() {
                    Some(channel) => channel,
                    None => &mut *data,
                };
                if let Err(e) = self.write_command(target, &command) {
                    return SessionEnd::Failed(format!("sending {}: {}", command, e));
                }
            }

            match data.read(&mut buf) {
                Ok(0) => {
                    if !self.settings.transport.is_file() {
                        return SessionEnd::Failed("connection closed by peer".to_string());
                    }
                    if !self.settings.auto_repeat_captured_playback {
                        return SessionEnd::Completed;
                    }
                    match data.rewind() {
                        Ok(true) => {
                            debug!("Restarting captured playback");
                            data_frames.clear();
                        }
                        Ok(false) => return SessionEnd::Completed,
                        Err(e) => return SessionEnd::Failed(e.to_string()),
                    }
                }
                Ok(n) => {
                    Counters::bump(&self.shared.counters.bytes, n as u64);
                    data_frames.extend(&buf[..n]);
                    if let Some(end) = self.drain(&mut data_frames) {
                        return end;
                    }
                }
                Err(e) if transport::is_timeout(&e) => {}
                Err(e) => return SessionEnd::Failed(e.to_string()),
            }

            if let Some(channel) = command_channel.as_deref_mut() {
                match channel.read(&mut buf) {
                    Ok(0) => return SessionEnd::Failed("command channel closed by peer".to_string()),
                    Ok(n) => {
                        Counters::bump(&self.shared.counters.bytes, n as u64);
                        command_frames.extend(&buf[..n]);
                        if let Some(end) = self.drain(&mut command_frames) {
                            return end;
                        }
                    }
                    Err(e) if transport::is_timeout(&e) => {}
                    Err(e) => return SessionEnd::Failed(e.to_string()),
                }
            }
        }
    }

    fn write_command(&self, target: &mut dyn Transport, command: &DeviceCommand) -> Result<(), ParserError> {
        let frame = self
            .codec
            .encode_command_frame(self.settings.command_id_code(), command, utc_now_ticks())?;
        debug!("Sending {} to {}", command, target.description());
        target.write_all(&frame)?;
        Ok(())
    }

    /// Decodes every complete frame in `assembler`.
    fn drain(&mut self, assembler: &mut FrameAssembler) -> Option<SessionEnd> {
        while let Some(next) = assembler.next_frame(self.codec.as_ref()) {
            if !self.shared.is_running() {
                return Some(SessionEnd::Stopped);
            }
            let result = next.and_then(|frame| self.handle_frame(&frame));
            if let Err(e) = result {
                // Resync inside the bad frame; its FRAMESIZE may be what was corrupted.
                assembler.reject();
                if self.parsing_exception(e.to_string()) {
                    return Some(SessionEnd::Tripped);
                }
            }
        }
        None
    }

    fn handle_frame(&mut self, frame: &[u8]) -> Result<(), CodecError> {
        let kind = self.codec.frame_kind(frame)?;
        Counters::bump(&self.shared.counters.frames, 1);
        self.emit(ParserEvent::ReceivedFrameBufferImage {
            kind,
            bytes: frame.to_vec(),
        });

        if kind == FrameKind::Data && self.configuration.is_none() {
            debug!("Skipping data frame received before any configuration frame");
            return Ok(());
        }

        let verify = self.settings.checksum_validation.contains(kind);
        let decoded = self.codec.decode(frame, self.configuration.as_ref(), verify)?;

        if let Some(access_id) = self.settings.access_id {
            if decoded.id_code() != access_id {
                debug!(
                    "Ignoring {} for ID code {}; listening for {}",
                    kind,
                    decoded.id_code(),
                    access_id
                );
                return Ok(());
            }
        }

        match decoded {
            DecodedFrame::Configuration { kind, frame } => {
                Counters::bump(&self.shared.counters.configuration, 1);
                info!(
                    "Received {:?} for ID code {} with {} cells at {} fps",
                    kind,
                    frame.id_code,
                    frame.cells.len(),
                    frame.frame_rate
                );
                self.configuration = Some(frame.clone());
                self.emit(ParserEvent::ConfigurationFrameReceived(kind, frame));

                let iec = self.settings.phasor_protocol == PhasorProtocol::Iec61850_90_5;
                if self.settings.auto_start_data_parsing_sequence && !self.enable_sent && !iec {
                    self.enable_sent = true;
                    self.outbox.push(DeviceCommand::EnableRealTimeData);
                }
            }
            DecodedFrame::Data { mut frame, .. } => {
                Counters::bump(&self.shared.counters.data, 1);
                if self.settings.simulate_timestamp {
                    frame.timestamp = utc_now_ticks();
                }
                self.emit(ParserEvent::DataFrameReceived(frame));
                self.pace_playback();
            }
            DecodedFrame::Header { id_code, text, .. } => {
                Counters::bump(&self.shared.counters.header, 1);
                self.emit(ParserEvent::HeaderFrameReceived { id_code, text });
            }
            DecodedFrame::Command { id_code, command } => {
                Counters::bump(&self.shared.counters.command, 1);
                self.emit(ParserEvent::CommandFrameReceived { id_code, command });
            }
        }
        Ok(())
    }

    /// Holds file playback to `definedFrameRate` data frames per second.
    fn pace_playback(&mut self) {
        let rate = self.settings.defined_frame_rate;
        if !self.settings.transport.is_file() || rate <= 0.0 {
            return;
        }
        let interval = Duration::from_secs_f64(1.0 / rate);
        let now = Instant::now();
        let due = match self.next_playback_frame {
            // Fell behind by more than a frame: start over instead of bursting.
            Some(due) if due + interval >= now => due,
            _ => now,
        };
        if due > now {
            self.shared.sleep(due - now);
        }
        self.next_playback_frame = Some(due + interval);
    }

    /// Reports one parsing exception. Returns true when the breaker trips.
    fn parsing_exception(&mut self, error: String) -> bool {
        Counters::bump(&self.shared.counters.exceptions, 1);
        debug!("Parsing exception: {}", error);
        self.emit(ParserEvent::ParsingException(error));

        if self.breaker.record(Instant::now()) {
            error!(
                "{} parsing exceptions within {} seconds; disconnecting",
                self.breaker.count(),
                self.settings.parsing_exception_window
            );
            self.emit(ParserEvent::ExceededParsingExceptionThreshold);
            return true;
        }
        false
    }

    /// Blocks while the event queue is full, giving up only when the parser stops.
    fn emit(&self, event: ParserEvent) {
        let mut event = event;
        loop {
            match self.events.try_send(event) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => return,
                Err(TrySendError::Full(returned)) => {
                    if !self.shared.is_running() {
                        return;
                    }
                    event = returned;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataFrameOptions;
    use crate::measurement::TICKS_PER_SECOND;
    use crate::random::{random_configuration, random_frame};
    use std::io::Write;
    use std::net::TcpListener;

    const START: i64 = 1_700_000_000 * TICKS_PER_SECOND;

    fn capture(frames: usize, corrupt_at: Option<usize>) -> (tempfile::NamedTempFile, ConfigurationFrame) {
        let mut rng = rand::rng();
        let config = random_configuration(235, 30, 2, &mut rng);
        let codec = codec_for(PhasorProtocol::IeeeC37_118V2);
        let images = codec.project_configuration(&config, 1, START).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(images.cfg2.as_deref().unwrap()).unwrap();
        for i in 0..frames {
            let frame = random_frame(&config, START + i as i64 * TICKS_PER_SECOND / 30, &mut rng);
            let mut bytes = codec
                .encode_data_frame(&config, &frame, DataFrameOptions::default())
                .unwrap();
            if corrupt_at == Some(i) {
                let last = bytes.len() - 1;
                bytes[last] ^= 0xFF;
            }
            file.write_all(&bytes).unwrap();
        }
        file.flush().unwrap();
        (file, config)
    }

    fn collect(events: &Receiver<ParserEvent>) -> Vec<ParserEvent> {
        let mut collected = Vec::new();
        while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
            let done = event == ParserEvent::ConnectionTerminated;
            collected.push(event);
            if done {
                break;
            }
        }
        collected
    }

    fn count(events: &[ParserEvent], predicate: impl Fn(&ParserEvent) -> bool) -> usize {
        events.iter().filter(|e| predicate(e)).count()
    }

    #[test]
    fn test_file_playback_decodes_every_frame() {
        let (file, config) = capture(5, Some(2));
        let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
            "phasorProtocol=IEEEC37_118V2; file={}; definedFrameRate=0",
            file.path().display()
        ))
        .unwrap();
        parser.start().unwrap();
        let events = collect(&events);
        parser.stop();

        assert_eq!(events.first(), Some(&ParserEvent::ConnectionAttempt { attempt: 1 }));
        assert_eq!(events.last(), Some(&ParserEvent::ConnectionTerminated));
        let received = events.iter().find_map(|e| match e {
            ParserEvent::ConfigurationFrameReceived(ConfigurationKind::Cfg2, frame) => Some(frame),
            _ => None,
        });
        let received = received.unwrap();
        assert_eq!(received.id_code, config.id_code);
        assert_eq!(received.cells.len(), config.cells.len());
        assert_eq!(count(&events, |e| matches!(e, ParserEvent::DataFrameReceived(_))), 4);
        assert_eq!(count(&events, |e| matches!(e, ParserEvent::ParsingException(_))), 1);

        let stats = parser.statistics();
        assert_eq!(stats.configuration_frames, 1);
        assert_eq!(stats.data_frames, 4);
        assert_eq!(stats.total_frames, 6);
        assert_eq!(stats.parsing_exceptions, 1);
        assert_eq!(parser.state(), ParserState::Disconnected);
    }

    #[test]
    fn test_access_id_filters_other_streams() {
        let (file, _) = capture(3, None);
        let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
            "file={}; definedFrameRate=0; accessID=99",
            file.path().display()
        ))
        .unwrap();
        parser.start().unwrap();
        let events = collect(&events);

        assert_eq!(
            count(&events, |e| matches!(e, ParserEvent::ConfigurationFrameReceived(..))),
            0
        );
        assert_eq!(count(&events, |e| matches!(e, ParserEvent::DataFrameReceived(_))), 0);
        assert_eq!(
            count(&events, |e| matches!(e, ParserEvent::ReceivedFrameBufferImage { .. })),
            4
        );
    }

    #[test]
    fn test_simulated_timestamps_replace_frame_times() {
        let (file, _) = capture(2, None);
        let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
            "file={}; definedFrameRate=0; simulateTimestamp=true",
            file.path().display()
        ))
        .unwrap();
        let before = utc_now_ticks();
        parser.start().unwrap();
        for event in collect(&events) {
            if let ParserEvent::DataFrameReceived(frame) = event {
                assert!(frame.timestamp >= before);
            }
        }
    }

    #[test]
    fn test_connection_failures_are_retried_then_abandoned() {
        // Bind then drop to get a port with nothing listening.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
            "server=127.0.0.1:{}; maximumConnectionAttempts=2; reconnectDelay=0",
            port
        ))
        .unwrap();
        parser.start().unwrap();
        let events = collect(&events);

        assert_eq!(
            count(&events, |e| matches!(e, ParserEvent::ConnectionAttempt { .. })),
            2
        );
        assert!(matches!(
            events[1],
            ParserEvent::ConnectionException { attempt: 1, .. }
        ));
        assert!(matches!(
            events[3],
            ParserEvent::ConnectionException { attempt: 2, .. }
        ));
        assert_eq!(events.last(), Some(&ParserEvent::ConnectionTerminated));
        assert_eq!(parser.statistics().connection_attempts, 2);
    }

    #[test]
    fn test_stop_is_idempotent_and_restartable() {
        let (file, _) = capture(1, None);
        let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
            "file={}; autoRepeatCapturedPlayback=true; definedFrameRate=60",
            file.path().display()
        ))
        .unwrap();
        parser.start().unwrap();
        parser.start().unwrap();
        assert!(events.recv_timeout(Duration::from_secs(5)).is_ok());
        parser.stop();
        parser.stop();
        assert!(!parser.is_running());

        parser.start().unwrap();
        assert!(parser.is_running());
        parser.stop();
        assert_eq!(parser.state(), ParserState::Disconnected);
    }
}
