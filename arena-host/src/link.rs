//! Acknowledged command link to one arena
//!
//! Every command waits for its acknowledgement with a deadline. Transport
//! failures close the link; negative acknowledgements leave it open.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use arena_core::traits::{ArenaControl, ArenaError};
use arena_protocol::messages::CMD_TRIAL_PARAMS;
use arena_protocol::{decode_frame, ArenaCommand, ColorDepth, Response, ResponseParser, TrialParams};
use tracing::{debug, info, trace, warn};

use crate::transport::{Endpoint, Transport};

const READ_CHUNK: usize = 256;

/// Longest drain on open, in flush windows, before the arena counts as babbling
const MAX_FLUSH_WINDOWS: u32 = 20;

/// Opens transports for a link
pub type Connector = Box<dyn FnMut(&Endpoint, Duration) -> io::Result<Box<dyn Transport>> + Send>;

/// Link timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkConfig {
    /// Connection attempt limit
    pub connect_timeout: Duration,
    /// Deadline for each acknowledgement
    pub ack_timeout: Duration,
    /// Added to a sequence's duration when waiting for its completion
    pub completion_grace: Duration,
    /// Quiet period that ends the stale-response drain on open
    pub flush_window: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Duration::from_millis(1000),
            completion_grace: Duration::from_millis(2000),
            flush_window: Duration::from_millis(100),
        }
    }
}

/// Connection to one arena controller
pub struct ArenaLink {
    endpoint: Endpoint,
    config: LinkConfig,
    connector: Connector,
    transport: Option<Box<dyn Transport>>,
    parser: ResponseParser,
    pending: VecDeque<Response>,
    /// Completion notifications of sequences started without waiting
    unclaimed_completions: usize,
}

impl ArenaLink {
    /// Create a closed link
    pub fn new(endpoint: Endpoint, config: LinkConfig) -> Self {
        Self::with_connector(
            endpoint,
            config,
            Box::new(|endpoint: &Endpoint, timeout| endpoint.connect(timeout)),
        )
    }

    /// Create a closed link with a custom transport factory
    pub fn with_connector(endpoint: Endpoint, config: LinkConfig, connector: Connector) -> Self {
        Self {
            endpoint,
            config,
            connector,
            transport: None,
            parser: ResponseParser::new(),
            pending: VecDeque::new(),
            unclaimed_completions: 0,
        }
    }

    /// Where this link connects
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Link timing
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>, ArenaError> {
        self.transport.as_mut().ok_or(ArenaError::NotOpen)
    }

    /// Close the link and turn an I/O error into a transport error
    fn fail(&mut self, command: &'static str, err: io::Error) -> ArenaError {
        warn!("{}: transport error, closing link: {}", command, err);
        self.close();
        ArenaError::Transport {
            command,
            source: err,
        }
    }

    fn send(&mut self, command: &ArenaCommand<'_>) -> Result<(), ArenaError> {
        let name = command.name();
        let bytes = command
            .encode()
            .map_err(|e| ArenaError::InvalidArgument(format!("{}: {}", name, e)))?;
        trace!("TX {} ({} bytes)", name, bytes.len());

        let result = self.transport()?.write_all(&bytes);
        result.map_err(|e| self.fail(name, e))
    }

    /// Wait for the next response to `opcode`
    ///
    /// The first responses carrying the trial opcode are the owed completions
    /// of sequences started without waiting, and are consumed one each. Any
    /// other response for a different opcode is stale and dropped.
    fn await_response(
        &mut self,
        command: &'static str,
        opcode: u8,
        wait: Duration,
    ) -> Result<Response, ArenaError> {
        let deadline = Instant::now() + wait;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            while let Some(response) = self.pending.pop_front() {
                if response.opcode == CMD_TRIAL_PARAMS && self.unclaimed_completions > 0 {
                    self.unclaimed_completions -= 1;
                    debug!(
                        "{}: consumed late sequence completion (status {}, {} still owed)",
                        command, response.status, self.unclaimed_completions
                    );
                    continue;
                }
                if response.opcode == opcode {
                    trace!(
                        "RX {} status {} {:?}",
                        command,
                        response.status,
                        response.message_str()
                    );
                    return Ok(response);
                }
                debug!(
                    "{}: dropping stale response for opcode 0x{:02X}",
                    command, response.opcode
                );
            }

            let now = Instant::now();
            if now >= deadline {
                warn!("{}: no response after {:?}, closing link", command, wait);
                self.close();
                return Err(ArenaError::Timeout {
                    command,
                    waited: wait,
                });
            }

            let read = self.transport()?.read(&mut buf, deadline - now);
            match read {
                Ok(0) => {
                    warn!("{}: arena closed the connection", command);
                    self.close();
                    return Err(ArenaError::Disconnected { command });
                }
                Ok(n) => {
                    for &byte in &buf[..n] {
                        match self.parser.feed(byte) {
                            Ok(Some(response)) => self.pending.push_back(response),
                            Ok(None) => {}
                            Err(error) => {
                                warn!("{}: unframeable response: {}", command, error);
                                self.close();
                                return Err(ArenaError::Malformed { command, error });
                            }
                        }
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => return Err(self.fail(command, e)),
            }
        }
    }

    /// Send a command and require a positive acknowledgement
    fn acknowledged(&mut self, command: ArenaCommand<'_>) -> Result<(), ArenaError> {
        let name = command.name();
        let opcode = command.opcode();
        self.send(&command)?;
        let response = self.await_response(name, opcode, self.config.ack_timeout)?;
        if response.is_ok() {
            Ok(())
        } else {
            warn!(
                "{} rejected: status {} {:?}",
                name,
                response.status,
                response.message_str()
            );
            Err(ArenaError::Command {
                command: name,
                status: response.status,
                message: response.message_str().to_string(),
            })
        }
    }

    /// Drain stale bytes until the arena has been quiet for the flush window
    ///
    /// Gives up and closes the link if the arena is still talking after
    /// `MAX_FLUSH_WINDOWS` windows.
    fn flush(&mut self) -> Result<(), ArenaError> {
        const COMMAND: &str = "open";
        let window = self.config.flush_window;
        let limit = window * MAX_FLUSH_WINDOWS;
        let started = Instant::now();
        let mut buf = [0u8; READ_CHUNK];
        let mut drained = 0usize;
        loop {
            if started.elapsed() >= limit {
                warn!(
                    "Arena still sending after {:?} ({} bytes drained), closing link",
                    limit, drained
                );
                self.close();
                return Err(ArenaError::Timeout {
                    command: COMMAND,
                    waited: limit,
                });
            }
            let read = self.transport()?.read(&mut buf, window);
            match read {
                Ok(0) => {
                    self.close();
                    return Err(ArenaError::Disconnected { command: COMMAND });
                }
                Ok(n) => drained += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) =>
                {
                    break
                }
                Err(e) => return Err(self.fail(COMMAND, e)),
            }
        }
        if drained > 0 {
            debug!("Flushed {} stale bytes", drained);
        }
        self.parser.reset();
        self.pending.clear();
        Ok(())
    }
}

impl ArenaControl for ArenaLink {
    fn open(&mut self, flush_responses: bool) -> Result<(), ArenaError> {
        if self.transport.is_some() {
            return Ok(());
        }

        let transport = (self.connector)(&self.endpoint, self.config.connect_timeout).map_err(
            |source| ArenaError::Connection {
                endpoint: self.endpoint.to_string(),
                source,
            },
        )?;
        self.transport = Some(transport);
        self.parser.reset();
        self.pending.clear();
        self.unclaimed_completions = 0;
        info!("Arena link open: {}", self.endpoint);

        if flush_responses {
            self.flush()?;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    fn all_on(&mut self) -> Result<(), ArenaError> {
        self.acknowledged(ArenaCommand::AllOn)
    }

    fn all_off(&mut self) -> Result<(), ArenaError> {
        self.acknowledged(ArenaCommand::AllOff)
    }

    fn set_color_depth(&mut self, bits: u8) -> Result<(), ArenaError> {
        let depth = ColorDepth::from_bits(bits)
            .map_err(|e| ArenaError::InvalidArgument(e.to_string()))?;
        self.acknowledged(ArenaCommand::SetColorDepth(depth))
    }

    fn trial_params(
        &mut self,
        params: &TrialParams,
        wait_for_completion: bool,
    ) -> Result<bool, ArenaError> {
        let command = ArenaCommand::TrialParams(*params);
        let name = command.name();
        self.send(&command)?;

        let accepted = self.await_response(name, CMD_TRIAL_PARAMS, self.config.ack_timeout)?;
        if !accepted.is_ok() {
            warn!(
                "trial_params rejected for pattern {}: status {} {:?}",
                params.pattern_id,
                accepted.status,
                accepted.message_str()
            );
            return Ok(false);
        }
        if !wait_for_completion {
            self.unclaimed_completions += 1;
            return Ok(true);
        }

        let duration = Duration::from_millis(params.duration_units as u64 * 100);
        let completion =
            self.await_response(name, CMD_TRIAL_PARAMS, duration + self.config.completion_grace)?;
        if !completion.is_ok() {
            warn!(
                "pattern {} sequence failed: status {} {:?}",
                params.pattern_id,
                completion.status,
                completion.message_str()
            );
        }
        Ok(completion.is_ok())
    }

    fn stream_frame(&mut self, block: &[u8]) -> Result<(), ArenaError> {
        decode_frame(block).map_err(|e| ArenaError::InvalidArgument(e.to_string()))?;
        self.acknowledged(ArenaCommand::StreamFrame(block))
    }

    fn stop_display(&mut self) -> Result<(), ArenaError> {
        self.acknowledged(ArenaCommand::StopDisplay)
    }

    fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
            info!("Arena link closed: {}", self.endpoint);
        }
        self.parser.reset();
        self.pending.clear();
        self.unclaimed_completions = 0;
    }
}

impl Drop for ArenaLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use arena_protocol::messages::{CMD_ALL_OFF, CMD_ALL_ON, CMD_SET_COLOR_DEPTH, CMD_STOP_DISPLAY};
    use arena_protocol::{encode_frame, PixelGrid};

    /// What the scripted arena does when it receives a command
    #[derive(Debug, Clone)]
    enum Reply {
        /// Send these responses
        Respond(Vec<Response>),
        /// Say nothing
        Silent,
        /// Close the connection
        Hangup,
        /// Fail the write
        WriteError,
    }

    #[derive(Default)]
    struct Script {
        replies: VecDeque<Reply>,
        written: Vec<Vec<u8>>,
        connects: usize,
        stale: Vec<u8>,
    }

    struct ScriptedTransport {
        script: Arc<Mutex<Script>>,
        outbox: VecDeque<u8>,
        closed: bool,
    }

    impl Transport for ScriptedTransport {
        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            let mut script = self.script.lock().unwrap();
            script.written.push(bytes.to_vec());
            match script.replies.pop_front().unwrap_or(Reply::Silent) {
                Reply::Respond(responses) => {
                    for r in responses {
                        self.outbox.extend(r.encode().iter().copied());
                    }
                }
                Reply::Silent => {}
                Reply::Hangup => self.closed = true,
                Reply::WriteError => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"))
                }
            }
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
            if self.outbox.is_empty() {
                if self.closed {
                    return Ok(0);
                }
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"));
            }
            let n = buf.len().min(self.outbox.len());
            for (slot, byte) in buf.iter_mut().zip(self.outbox.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    fn ok(opcode: u8) -> Response {
        Response::new(0, opcode, "")
    }

    fn nak(opcode: u8, message: &str) -> Response {
        Response::new(1, opcode, message)
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            connect_timeout: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(50),
            completion_grace: Duration::from_millis(50),
            flush_window: Duration::from_millis(10),
        }
    }

    fn scripted_link(replies: Vec<Reply>) -> (ArenaLink, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(Script {
            replies: replies.into(),
            ..Script::default()
        }));
        let shared = script.clone();
        let connector: Connector = Box::new(move |_endpoint: &Endpoint, _timeout| {
            let mut s = shared.lock().unwrap();
            s.connects += 1;
            let stale = std::mem::take(&mut s.stale);
            Ok(Box::new(ScriptedTransport {
                script: shared.clone(),
                outbox: stale.into(),
                closed: false,
            }) as Box<dyn Transport>)
        });
        let link = ArenaLink::with_connector(Endpoint::DryRun, fast_config(), connector);
        (link, script)
    }

    fn params(duration_units: u16) -> TrialParams {
        TrialParams {
            gs_level: 4,
            pattern_id: 7,
            frame_rate: 20,
            repeat_count: 0,
            start_frame: 0,
            duration_units,
        }
    }

    #[test]
    fn test_commands_require_open() {
        let (mut link, script) = scripted_link(vec![]);
        assert!(matches!(link.all_on(), Err(ArenaError::NotOpen)));
        assert!(matches!(link.stop_display(), Err(ArenaError::NotOpen)));
        assert!(matches!(
            link.trial_params(&params(10), true),
            Err(ArenaError::NotOpen)
        ));
        assert!(script.lock().unwrap().written.is_empty());
    }

    #[test]
    fn test_all_on_bytes_and_ack() {
        let (mut link, script) = scripted_link(vec![Reply::Respond(vec![ok(CMD_ALL_ON)])]);
        link.open(false).unwrap();
        link.all_on().unwrap();

        let script = script.lock().unwrap();
        assert_eq!(script.written, vec![vec![0x01, 0xFF]]);
        assert!(link.is_open());
    }

    #[test]
    fn test_negative_ack_keeps_link_open() {
        let (mut link, _) = scripted_link(vec![
            Reply::Respond(vec![nak(CMD_ALL_OFF, "busy")]),
            Reply::Respond(vec![ok(CMD_ALL_OFF)]),
        ]);
        link.open(false).unwrap();

        match link.all_off() {
            Err(ArenaError::Command {
                command, message, ..
            }) => {
                assert_eq!(command, "all_off");
                assert_eq!(message, "busy");
            }
            other => panic!("expected command error, got {:?}", other),
        }
        assert!(link.is_open());
        link.all_off().unwrap();
    }

    #[test]
    fn test_ack_timeout_closes_link() {
        let (mut link, _) = scripted_link(vec![Reply::Silent]);
        link.open(false).unwrap();

        let start = Instant::now();
        let err = link.stop_display().unwrap_err();
        assert!(matches!(err, ArenaError::Timeout { command: "stop_display", .. }));
        assert!(err.is_transport());
        assert!(!link.is_open());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_trial_params_waits_for_completion() {
        let (mut link, script) = scripted_link(vec![Reply::Respond(vec![
            ok(CMD_TRIAL_PARAMS),
            Response::new(0, CMD_TRIAL_PARAMS, "sequence completed"),
        ])]);
        link.open(false).unwrap();
        assert_eq!(link.trial_params(&params(1), true).unwrap(), true);

        let script = script.lock().unwrap();
        assert_eq!(
            script.written[0],
            vec![0x0C, 0x08, 4, 7, 0, 20, 0, 0, 0, 0, 0, 1, 0]
        );
    }

    #[test]
    fn test_trial_params_rejected_returns_false() {
        let (mut link, _) = scripted_link(vec![Reply::Respond(vec![nak(
            CMD_TRIAL_PARAMS,
            "pattern not found",
        )])]);
        link.open(false).unwrap();
        assert_eq!(link.trial_params(&params(1), true).unwrap(), false);
        assert!(link.is_open());
    }

    #[test]
    fn test_trial_params_failed_sequence_returns_false() {
        let (mut link, _) = scripted_link(vec![Reply::Respond(vec![
            ok(CMD_TRIAL_PARAMS),
            nak(CMD_TRIAL_PARAMS, "sd read error"),
        ])]);
        link.open(false).unwrap();
        assert_eq!(link.trial_params(&params(1), true).unwrap(), false);
    }

    #[test]
    fn test_trial_params_without_wait() {
        let (mut link, _) = scripted_link(vec![
            Reply::Respond(vec![ok(CMD_TRIAL_PARAMS)]),
            Reply::Respond(vec![
                Response::new(0, CMD_TRIAL_PARAMS, "sequence completed"),
                ok(CMD_STOP_DISPLAY),
            ]),
        ]);
        link.open(false).unwrap();
        assert!(link.trial_params(&params(50), false).unwrap());
        // Late completion notification is skipped as stale
        link.stop_display().unwrap();
    }

    #[test]
    fn test_unclaimed_completion_not_taken_as_acceptance() {
        let (mut link, _) = scripted_link(vec![
            Reply::Respond(vec![ok(CMD_TRIAL_PARAMS), ok(CMD_TRIAL_PARAMS)]),
            Reply::Respond(vec![nak(CMD_TRIAL_PARAMS, "busy")]),
        ]);
        link.open(false).unwrap();
        assert!(link.trial_params(&params(10), false).unwrap());
        assert!(!link.trial_params(&params(10), false).unwrap());
        assert!(link.is_open());
    }

    #[test]
    fn test_late_completion_not_taken_as_acceptance() {
        let (mut link, _) = scripted_link(vec![
            Reply::Respond(vec![ok(CMD_TRIAL_PARAMS)]),
            Reply::Respond(vec![
                Response::new(0, CMD_TRIAL_PARAMS, "sequence completed"),
                nak(CMD_TRIAL_PARAMS, "pattern not found"),
            ]),
        ]);
        link.open(false).unwrap();
        assert!(link.trial_params(&params(10), false).unwrap());
        assert!(!link.trial_params(&params(10), false).unwrap());
        assert!(link.is_open());
    }

    #[test]
    fn test_owed_completion_skipped_before_waited_sequence() {
        let (mut link, _) = scripted_link(vec![
            Reply::Respond(vec![ok(CMD_TRIAL_PARAMS)]),
            Reply::Respond(vec![
                Response::new(0, CMD_TRIAL_PARAMS, "sequence completed"),
                ok(CMD_TRIAL_PARAMS),
                nak(CMD_TRIAL_PARAMS, "sd read error"),
            ]),
            Reply::Respond(vec![ok(CMD_ALL_OFF)]),
        ]);
        link.open(false).unwrap();
        assert!(link.trial_params(&params(1), false).unwrap());
        // Completion of the first sequence must not stand in for the second's
        assert!(!link.trial_params(&params(1), true).unwrap());
        link.all_off().unwrap();
    }

    #[test]
    fn test_owed_completion_counter_resets_on_close() {
        let (mut link, _) = scripted_link(vec![
            Reply::Respond(vec![ok(CMD_TRIAL_PARAMS)]),
            Reply::Respond(vec![nak(CMD_TRIAL_PARAMS, "pattern not found")]),
        ]);
        link.open(false).unwrap();
        assert!(link.trial_params(&params(10), false).unwrap());
        link.close();

        link.open(false).unwrap();
        assert!(!link.trial_params(&params(10), false).unwrap());
    }

    #[test]
    fn test_completion_wait_is_bounded() {
        let (mut link, _) = scripted_link(vec![Reply::Respond(vec![ok(CMD_TRIAL_PARAMS)])]);
        link.open(false).unwrap();

        let start = Instant::now();
        let err = link.trial_params(&params(1), true).unwrap_err();
        assert!(matches!(err, ArenaError::Timeout { .. }));
        // 100 ms sequence + 50 ms grace
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!link.is_open());
    }

    #[test]
    fn test_peer_hangup_is_transport_error() {
        let (mut link, _) = scripted_link(vec![Reply::Hangup]);
        link.open(false).unwrap();
        let err = link.all_on().unwrap_err();
        assert!(matches!(err, ArenaError::Disconnected { command: "all_on" }));
        assert!(!link.is_open());
    }

    #[test]
    fn test_write_error_closes_link() {
        let (mut link, _) = scripted_link(vec![Reply::WriteError]);
        link.open(false).unwrap();
        let err = link.all_off().unwrap_err();
        assert!(matches!(err, ArenaError::Transport { command: "all_off", .. }));
        assert!(!link.is_open());
    }

    #[test]
    fn test_invalid_depth_sends_nothing() {
        let (mut link, script) = scripted_link(vec![]);
        link.open(false).unwrap();
        assert!(matches!(
            link.set_color_depth(2),
            Err(ArenaError::InvalidArgument(_))
        ));
        assert!(script.lock().unwrap().written.is_empty());
        assert!(link.is_open());
    }

    #[test]
    fn test_set_color_depth_bytes() {
        let (mut link, script) =
            scripted_link(vec![Reply::Respond(vec![ok(CMD_SET_COLOR_DEPTH)])]);
        link.open(false).unwrap();
        link.set_color_depth(4).unwrap();
        assert_eq!(script.lock().unwrap().written[0], vec![0x02, 0x06, 4]);
    }

    #[test]
    fn test_stream_frame_validates_block() {
        let (mut link, script) = scripted_link(vec![Reply::Respond(vec![Response::new(
            0,
            arena_protocol::messages::CMD_STREAM_FRAME,
            "",
        )])]);
        link.open(false).unwrap();

        assert!(matches!(
            link.stream_frame(&[0x01, 0x10, 0x00]),
            Err(ArenaError::InvalidArgument(_))
        ));

        let block = encode_frame(&PixelGrid::filled(1), 3, ColorDepth::OneBit);
        link.stream_frame(&block).unwrap();
        let written = &script.lock().unwrap().written[0];
        assert_eq!(&written[..5], &[0x32, 52, 0, 3, 0x10]);
        assert_eq!(written.len(), 3 + 52);
    }

    #[test]
    fn test_flush_on_open_discards_stale_responses() {
        let (mut link, script) = scripted_link(vec![Reply::Respond(vec![ok(CMD_ALL_ON)])]);
        script.lock().unwrap().stale = nak(CMD_ALL_ON, "left over").encode().to_vec();

        link.open(true).unwrap();
        link.all_on().unwrap();
    }

    struct ChattyTransport;

    impl Transport for ChattyTransport {
        fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
            std::thread::sleep(Duration::from_millis(1));
            buf[0] = 0xAA;
            Ok(1)
        }
    }

    #[test]
    fn test_flush_gives_up_on_endless_stream() {
        let connector: Connector = Box::new(|_endpoint: &Endpoint, _timeout| {
            Ok(Box::new(ChattyTransport) as Box<dyn Transport>)
        });
        let mut link = ArenaLink::with_connector(Endpoint::DryRun, fast_config(), connector);

        let start = Instant::now();
        let err = link.open(true).unwrap_err();
        assert!(matches!(err, ArenaError::Timeout { command: "open", .. }));
        assert!(!link.is_open());
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_close_is_idempotent_and_reopen_uses_fresh_transport() {
        let (mut link, script) = scripted_link(vec![]);
        link.open(false).unwrap();
        link.open(false).unwrap();
        link.close();
        link.close();
        assert!(!link.is_open());

        link.open(false).unwrap();
        assert_eq!(script.lock().unwrap().connects, 2);
    }

    #[test]
    fn test_connection_failure() {
        let connector: Connector = Box::new(|_endpoint: &Endpoint, _timeout| {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        });
        let mut link = ArenaLink::with_connector(
            Endpoint::parse("127.0.0.1:9").unwrap(),
            fast_config(),
            connector,
        );
        let err = link.open(false).unwrap_err();
        assert!(matches!(err, ArenaError::Connection { ref endpoint, .. } if endpoint == "127.0.0.1:9"));
        assert!(err.is_transport());
    }

    #[test]
    fn test_dry_run_endpoint_end_to_end() {
        let mut link = ArenaLink::new(Endpoint::DryRun, fast_config());
        link.open(true).unwrap();
        link.set_color_depth(1).unwrap();
        link.all_on().unwrap();
        assert!(link.trial_params(&params(30), true).unwrap());
        link.stop_display().unwrap();
        link.all_off().unwrap();
        link.close();
    }

    #[test]
    fn test_tcp_endpoint_end_to_end() {
        use std::io::{Read, Write};
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(buf, [0x01, 0xFF]);
            stream.write_all(&ok(CMD_ALL_ON).encode()).unwrap();
        });

        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".into(),
            port,
        };
        let mut link = ArenaLink::new(endpoint, fast_config());
        link.open(false).unwrap();
        link.all_on().unwrap();
        server.join().unwrap();

        // Server hung up after answering
        let err = link.all_off().unwrap_err();
        assert!(err.is_transport());
    }
}
