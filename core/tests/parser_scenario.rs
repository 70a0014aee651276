//! Parser sessions against a loopback device and a corrupted capture file.

use pdc_core::codec::{
    codec_for, ConfigurationKind, DataFrameOptions, DecodedFrame, DeviceCommand, PhasorProtocol,
    ProtocolCodec,
};
use pdc_core::measurement::{Ticks, TICKS_PER_SECOND};
use pdc_core::model::ConfigurationFrame;
use pdc_core::parser::assembler::FrameAssembler;
use pdc_core::parser::{MultiProtocolFrameParser, ParserEvent};
use pdc_core::random::{random_configuration, random_frame};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

const T0: Ticks = 1_700_000_000 * TICKS_PER_SECOND;

fn wait_for(
    events: &Receiver<ParserEvent>,
    mut done: impl FnMut(&ParserEvent) -> bool,
) -> Vec<ParserEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.recv_timeout(Duration::from_secs(5)) {
        let finished = done(&event);
        seen.push(event);
        if finished {
            break;
        }
    }
    seen
}

/// Serves one client: answers CFG-2 and streams `frames` data frames once enabled.
/// Returns the commands it received with their ID codes.
fn spawn_device(
    listener: TcpListener,
    config: ConfigurationFrame,
    frames: usize,
) -> thread::JoinHandle<Vec<(u16, DeviceCommand)>> {
    thread::spawn(move || {
        let codec = codec_for(PhasorProtocol::IeeeC37_118V2);
        let (mut socket, _) = listener.accept().unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut assembler = FrameAssembler::default();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];

        while !received
            .iter()
            .any(|(_, c)| *c == DeviceCommand::EnableRealTimeData)
        {
            let n = socket.read(&mut buf).unwrap();
            assert!(n > 0, "parser hung up before enabling data");
            assembler.extend(&buf[..n]);
            while let Some(frame) = assembler.next_frame(codec.as_ref()) {
                let frame = frame.unwrap();
                match codec.decode(&frame, None, true).unwrap() {
                    DecodedFrame::Command { id_code, command } => {
                        if command == DeviceCommand::SendConfigurationFrame2 {
                            let images = codec.project_configuration(&config, 0, T0).unwrap();
                            socket.write_all(images.cfg2.as_deref().unwrap()).unwrap();
                        }
                        received.push((id_code, command));
                    }
                    other => panic!("device received {:?}", other.kind()),
                }
            }
        }

        let mut rng = rand::rng();
        for i in 0..frames {
            let frame = random_frame(&config, T0 + i as i64 * TICKS_PER_SECOND / 30, &mut rng);
            let bytes = codec
                .encode_data_frame(&config, &frame, DataFrameOptions::default())
                .unwrap();
            socket.write_all(&bytes).unwrap();
        }
        received
    })
}

#[test]
fn test_tcp_session_runs_the_start_sequence() {
    let config = random_configuration(235, 30, 3, &mut rand::rng());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let device = spawn_device(listener, config.clone(), 10);

    let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
        "phasorProtocol=IEEEC37_118V2; transportProtocol=Tcp; server=127.0.0.1:{}; accessID=235",
        port
    ))
    .unwrap();
    parser.start().unwrap();

    let mut data_frames = 0;
    let seen = wait_for(&events, |event| {
        if matches!(event, ParserEvent::DataFrameReceived(_)) {
            data_frames += 1;
        }
        data_frames == 10
    });
    let commands = device.join().unwrap();
    parser.stop();

    assert_eq!(
        commands,
        vec![
            (235, DeviceCommand::DisableRealTimeData),
            (235, DeviceCommand::SendConfigurationFrame2),
            (235, DeviceCommand::EnableRealTimeData),
        ]
    );
    assert_eq!(seen[0], ParserEvent::ConnectionAttempt { attempt: 1 });
    assert_eq!(seen[1], ParserEvent::ConnectionEstablished);

    let configuration = seen.iter().find_map(|event| match event {
        ParserEvent::ConfigurationFrameReceived(kind, frame) => Some((*kind, frame)),
        _ => None,
    });
    let (kind, received) = configuration.unwrap();
    assert_eq!(kind, ConfigurationKind::Cfg2);
    assert_eq!(received.cells.len(), 3);

    let frames: Vec<_> = seen
        .iter()
        .filter_map(|event| match event {
            ParserEvent::DataFrameReceived(frame) => Some(frame),
            _ => None,
        })
        .collect();
    assert_eq!(frames.len(), 10);
    assert!(frames.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    let stats = parser.statistics();
    assert_eq!(stats.configuration_frames, 1);
    assert_eq!(stats.data_frames, 10);
    assert_eq!(stats.parsing_exceptions, 0);
    assert!(stats.total_bytes_received > 0);
}

#[test]
fn test_exception_window_disconnects_for_good() {
    let mut rng = rand::rng();
    let config = random_configuration(1, 30, 1, &mut rng);
    let codec = codec_for(PhasorProtocol::IeeeC37_118V2);
    let images = codec.project_configuration(&config, 0, T0).unwrap();

    let mut capture = tempfile::NamedTempFile::new().unwrap();
    capture.write_all(images.cfg2.as_deref().unwrap()).unwrap();
    for i in 0..12 {
        let frame = random_frame(&config, T0 + i * TICKS_PER_SECOND / 30, &mut rng);
        let mut bytes = codec
            .encode_data_frame(&config, &frame, DataFrameOptions::default())
            .unwrap();
        let crc = bytes.len() - 2;
        bytes[crc] ^= 0x5A;
        capture.write_all(&bytes).unwrap();
    }
    capture.flush().unwrap();

    // Replay would loop forever if the breaker did not end the session.
    let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
        "file={}; definedFrameRate=0; autoRepeatCapturedPlayback=true; \
         allowedParsingExceptions=3; parsingExceptionWindow=5",
        capture.path().display()
    ))
    .unwrap();
    parser.start().unwrap();
    let seen = wait_for(&events, |event| *event == ParserEvent::ConnectionTerminated);

    let exceptions = seen
        .iter()
        .filter(|e| matches!(e, ParserEvent::ParsingException(_)))
        .count();
    assert_eq!(exceptions, 4);
    let tripped = seen
        .iter()
        .position(|e| *e == ParserEvent::ExceededParsingExceptionThreshold)
        .unwrap();
    assert_eq!(seen.last(), Some(&ParserEvent::ConnectionTerminated));
    assert!(tripped < seen.len() - 1);
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, ParserEvent::ConnectionAttempt { .. }))
            .count(),
        1
    );

    // Nothing follows the termination.
    assert!(events.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(!parser.is_running());
    assert_eq!(parser.statistics().parsing_exceptions, 4);
}

/// A data frame with no SYNC byte past its first, so resync can only land on frame starts.
fn sync_free_data_frame(
    codec: &dyn ProtocolCodec,
    config: &ConfigurationFrame,
    index: i64,
    rng: &mut StdRng,
) -> Vec<u8> {
    loop {
        let frame = random_frame(config, T0 + index * TICKS_PER_SECOND / 30, rng);
        let bytes = codec
            .encode_data_frame(config, &frame, DataFrameOptions::default())
            .unwrap();
        if !bytes[1..].contains(&0xAA) {
            return bytes;
        }
    }
}

fn set_framesize(frame: &mut [u8], size: usize) {
    let size = size as u16;
    frame[2..4].copy_from_slice(&size.to_be_bytes());
    assert!(!frame[2..4].contains(&0xAA));
}

#[derive(Clone, Copy)]
enum BadLength {
    Times(usize),
    Plus(usize),
    Minus(usize),
}

impl BadLength {
    fn apply(self, len: usize) -> usize {
        match self {
            BadLength::Times(n) => len * n,
            BadLength::Plus(n) => len + n,
            BadLength::Minus(n) => len - n,
        }
    }
}

/// CFG-2 followed by `frames` data frames, with FRAMESIZE rewritten for the indexes
/// listed in `corrupt`.
fn capture_with_bad_lengths(frames: i64, corrupt: &[(i64, BadLength)]) -> tempfile::NamedTempFile {
    let mut rng = StdRng::seed_from_u64(0xF5);
    let config = random_configuration(1, 30, 1, &mut rng);
    let codec = codec_for(PhasorProtocol::IeeeC37_118V2);
    let images = codec.project_configuration(&config, 0, T0).unwrap();

    let mut capture = tempfile::NamedTempFile::new().unwrap();
    capture.write_all(images.cfg2.as_deref().unwrap()).unwrap();
    for i in 0..frames {
        let mut bytes = sync_free_data_frame(codec.as_ref(), &config, i, &mut rng);
        if let Some((_, bad)) = corrupt.iter().find(|(index, _)| *index == i) {
            let size = bad.apply(bytes.len());
            set_framesize(&mut bytes, size);
        }
        capture.write_all(&bytes).unwrap();
    }
    capture.flush().unwrap();
    capture
}

fn count_events(seen: &[ParserEvent]) -> (usize, usize) {
    let data = seen
        .iter()
        .filter(|e| matches!(e, ParserEvent::DataFrameReceived(_)))
        .count();
    let exceptions = seen
        .iter()
        .filter(|e| matches!(e, ParserEvent::ParsingException(_)))
        .count();
    (data, exceptions)
}

#[test]
fn test_bad_frame_length_costs_only_that_frame() {
    // One FRAMESIZE overstates the frame and swallows the next two; one understates it.
    let capture = capture_with_bad_lengths(12, &[(3, BadLength::Times(3)), (8, BadLength::Minus(4))]);

    let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
        "file={}; definedFrameRate=0; allowedParsingExceptions=2; parsingExceptionWindow=5",
        capture.path().display()
    ))
    .unwrap();
    parser.start().unwrap();
    let seen = wait_for(&events, |event| *event == ParserEvent::ConnectionTerminated);

    let (data, exceptions) = count_events(&seen);
    assert_eq!(exceptions, 2);
    assert_eq!(data, 10);
    assert!(!seen.contains(&ParserEvent::ExceededParsingExceptionThreshold));

    let stats = parser.statistics();
    assert_eq!(stats.data_frames, 10);
    assert_eq!(stats.parsing_exceptions, 2);
}

#[test]
fn test_third_bad_frame_length_in_window_disconnects() {
    let capture = capture_with_bad_lengths(
        12,
        &[
            (2, BadLength::Times(3)),
            (6, BadLength::Minus(4)),
            (9, BadLength::Plus(6)),
        ],
    );

    let (parser, events) = MultiProtocolFrameParser::initialize(&format!(
        "file={}; definedFrameRate=0; allowedParsingExceptions=2; parsingExceptionWindow=5",
        capture.path().display()
    ))
    .unwrap();
    parser.start().unwrap();
    let seen = wait_for(&events, |event| *event == ParserEvent::ConnectionTerminated);

    let (data, exceptions) = count_events(&seen);
    assert_eq!(exceptions, 3);
    // Everything ahead of the third bad frame was still decoded.
    assert_eq!(data, 7);
    let tripped = seen
        .iter()
        .position(|e| *e == ParserEvent::ExceededParsingExceptionThreshold)
        .unwrap();
    assert_eq!(tripped, seen.len() - 2);
    assert_eq!(seen.last(), Some(&ParserEvent::ConnectionTerminated));
    assert_eq!(parser.statistics().parsing_exceptions, 3);
}
