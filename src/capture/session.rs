//! Capture session lifecycle and event loop
//!
//! A session owns the link to the capture service, one stream on it, the
//! format negotiator and the buffer exchange. The event loop runs on a
//! single thread; frames are encoded synchronously inside it, so a slow
//! consumer naturally backpressures the dequeue rate instead of growing a
//! queue.

use std::os::fd::OwnedFd;

use serde::Serialize;
use tracing::{debug, error, info};

use crate::capture::caps;
use crate::capture::exchange::{ExchangeStats, FrameBufferExchange, FrameSink};
use crate::capture::negotiate::FormatNegotiator;
use crate::error::{RelayError, Result};
use crate::service::link::{
    Direction, ServiceLink, StreamEvent, StreamFlags, StreamHandle, StreamProperties, Transport,
};

const DEFAULT_STREAM_NAME: &str = "castrelay capture stream";
const DEFAULT_FRAMERATE: u32 = 30;

/// Session lifetime states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    StreamCreated,
    Negotiating,
    Streaming,
    Stopped,
    Failed,
}

/// Capture session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Stream node to capture from
    pub node_id: u32,
    /// Target framerate offered during negotiation
    pub framerate: u32,
    /// Human readable stream name
    pub stream_name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            framerate: DEFAULT_FRAMERATE,
            stream_name: DEFAULT_STREAM_NAME.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn with_stream_name(mut self, name: impl Into<String>) -> Self {
        self.stream_name = name.into();
        self
    }
}

/// Counters accumulated over one session run
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    /// Formats the service fixated over the session lifetime
    pub formats_negotiated: u64,
    pub exchange: ExchangeStats,
}

/// A capture session over one inherited service handle
pub struct CaptureSession {
    config: SessionConfig,
    state: SessionState,
    link: Option<ServiceLink>,
    stream: Option<StreamHandle>,
    negotiator: FormatNegotiator,
    exchange: FrameBufferExchange,
}

impl CaptureSession {
    pub fn new(config: SessionConfig) -> Self {
        let exchange = FrameBufferExchange::new(config.node_id);
        Self {
            config,
            state: SessionState::Disconnected,
            link: None,
            stream: None,
            negotiator: FormatNegotiator::new(),
            exchange,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            formats_negotiated: self.negotiator.accepted(),
            exchange: *self.exchange.stats(),
        }
    }

    /// Connect to the capture service over the inherited handle
    pub fn connect(&mut self, transport: &Transport, fd: OwnedFd) -> Result<()> {
        if self.state != SessionState::Disconnected {
            return Err(RelayError::Connect(
                "session is already connected".into(),
            ));
        }
        self.state = SessionState::Connecting;
        match transport.connect(fd) {
            Ok(link) => {
                self.link = Some(link);
                self.state = SessionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Create the capture stream and ask the service to wire it up
    ///
    /// Offers the full raw format enumeration; on success the service has
    /// fixated a format and negotiation completes on the event loop.
    pub fn connect_stream(&mut self) -> Result<()> {
        if self.state != SessionState::Connected {
            return Err(RelayError::Transport(
                "session is not connected to a service".into(),
            ));
        }
        let Some(link) = self.link.as_ref() else {
            return Err(RelayError::Transport("session has no link".into()));
        };

        let stream = link.create_stream(StreamProperties::screen_capture(
            self.config.stream_name.clone(),
        ));
        self.state = SessionState::StreamCreated;

        let params = vec![caps::video_enum_format(self.config.framerate)];
        if let Err(e) = stream.connect(
            self.config.node_id,
            Direction::Input,
            StreamFlags::autoconnect_mapped(),
            params,
        ) {
            self.teardown();
            self.state = SessionState::Failed;
            return Err(e);
        }

        info!("connected to stream node {}", self.config.node_id);
        self.stream = Some(stream);
        self.state = SessionState::Negotiating;
        Ok(())
    }

    /// Pump stream events until the service stops the session
    ///
    /// Parameter events feed the negotiator, process events feed the
    /// exchange and service errors are logged without interrupting the
    /// loop. Returns once the service hangs up; a broken transport is the
    /// only error path out.
    pub fn run(&mut self, sink: &mut dyn FrameSink) -> Result<()> {
        if self.state != SessionState::Negotiating || self.stream.is_none() {
            return Err(RelayError::Transport(
                "session has no connected stream".into(),
            ));
        }
        self.state = SessionState::Streaming;
        debug!("starting capture loop");

        loop {
            let event = match self.stream.as_ref() {
                Some(stream) => stream.wait_event(),
                None => {
                    self.state = SessionState::Failed;
                    return Err(RelayError::Transport("capture stream went away".into()));
                }
            };
            match event {
                Ok(Some(StreamEvent::ParamChanged { id, param })) => {
                    self.negotiator.param_changed(id, param.as_ref());
                }
                Ok(Some(StreamEvent::Process)) => {
                    if let Some(stream) = self.stream.as_ref() {
                        self.exchange
                            .process(stream, self.negotiator.current(), sink);
                    }
                }
                Ok(Some(StreamEvent::CoreError { seq, message })) => {
                    error!("capture service error (seq {}): {}", seq, message);
                }
                Ok(None) => {
                    info!("capture service closed the session, stopping");
                    self.teardown();
                    self.state = SessionState::Stopped;
                    return Ok(());
                }
                Err(e) => {
                    self.teardown();
                    self.state = SessionState::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Drop the stream and the link, releasing their service-side claims
    fn teardown(&mut self) {
        self.stream = None;
        self.link = None;
    }
}

/// Connect over an inherited capture service handle and relay frames until
/// the service ends the session
///
/// Composes the whole session lifecycle; returns the accumulated counters
/// on a clean stop.
pub fn run_capture(
    transport: &Transport,
    fd: OwnedFd,
    config: SessionConfig,
    sink: &mut dyn FrameSink,
) -> Result<SessionStats> {
    let mut session = CaptureSession::new(config);
    session.connect(transport, fd)?;
    session.connect_stream()?;
    session.run(sink)?;
    Ok(session.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    use crate::capture::buffer::FrameBuffer;
    use crate::capture::format::{PixelFormat, Resolution, VideoFormat};
    use crate::service::host::{CaptureHost, HostConfig};

    struct CollectSink {
        frames: Vec<(u32, VideoFormat, usize)>,
    }

    impl CollectSink {
        fn new() -> Self {
            Self { frames: Vec::new() }
        }
    }

    impl FrameSink for CollectSink {
        fn deliver_frame(
            &mut self,
            node_id: u32,
            format: &VideoFormat,
            buffer: &FrameBuffer,
        ) -> Result<()> {
            let len = buffer
                .primary()
                .and_then(|p| p.readable_data())
                .map(|d| d.len())
                .unwrap_or(0);
            self.frames.push((node_id, *format, len));
            Ok(())
        }
    }

    fn foreign_fd() -> std::os::fd::OwnedFd {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        // Leak the peer end so the fd stays open for the test
        std::mem::forget(theirs);
        ours
    }

    #[test]
    fn test_connect_failure_reaches_failed_state() {
        let transport = Transport::new();
        let mut session = CaptureSession::new(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Disconnected);

        let err = session.connect(&transport, foreign_fd()).unwrap_err();
        assert!(matches!(err, RelayError::Connect(_)));
        assert_eq!(err.exit_code(), -2);
        assert_eq!(session.state(), SessionState::Failed);

        // No stream exists after a failed connect
        assert!(session.connect_stream().is_err());
        let mut sink = CollectSink::new();
        assert!(session.run(&mut sink).is_err());
    }

    #[test]
    fn test_stream_refusal_reaches_failed_state() {
        let transport = Transport::new();
        let host = CaptureHost::new(
            &transport,
            HostConfig::default().with_accept_streams(false),
        )
        .unwrap();

        let config = SessionConfig::default().with_node_id(host.node_id());
        let mut session = CaptureSession::new(config);
        session.connect(&transport, host.remote_fd().unwrap()).unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        let err = session.connect_stream().unwrap_err();
        assert!(matches!(err, RelayError::StreamConnect(_)));
        assert_eq!(err.exit_code(), -3);
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!host.is_stream_connected());
        // The failed session released its service claim
        assert!(!host.is_session_connected());
    }

    #[test]
    fn test_session_relays_queued_frames_then_stops() {
        let transport = Transport::new();
        let host = CaptureHost::new(&transport, HostConfig::default()).unwrap();

        let config = SessionConfig::default()
            .with_node_id(host.node_id())
            .with_framerate(30)
            .with_stream_name("session test");
        let mut session = CaptureSession::new(config);
        session.connect(&transport, host.remote_fd().unwrap()).unwrap();
        session.connect_stream().unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);
        assert!(host.is_stream_connected());

        // Queue the whole exchange up front; the loop drains it and then
        // observes the hangup.
        host.feed_frame(&[1u8; 64]).unwrap();
        host.feed_frame(&[2u8; 64]).unwrap();
        host.feed_empty_frame().unwrap();
        host.report_error("transient glitch").unwrap();
        host.disconnect();

        let mut sink = CollectSink::new();
        session.run(&mut sink).unwrap();
        assert_eq!(session.state(), SessionState::Stopped);

        assert_eq!(sink.frames.len(), 2);
        let format = host.negotiated_format().unwrap();
        assert_eq!(sink.frames[0].1, format);

        let stats = session.stats();
        assert_eq!(stats.formats_negotiated, 1);
        assert_eq!(stats.exchange.forwarded, 2);
        assert_eq!(stats.exchange.empty, 1);

        // Every buffer went back and the service claims were released
        let pool = host.pool_stats();
        assert_eq!(pool.leased, 0);
        assert_eq!(pool.requeued, 3);
        assert!(!host.is_session_connected());
        assert!(!host.is_stream_connected());
    }

    #[test]
    fn test_renegotiation_mid_stream() {
        let transport = Transport::new();
        let host = CaptureHost::new(&transport, HostConfig::default()).unwrap();

        let config = SessionConfig::default().with_node_id(host.node_id());
        let mut session = CaptureSession::new(config);
        session.connect(&transport, host.remote_fd().unwrap()).unwrap();
        session.connect_stream().unwrap();

        host.feed_frame(&[1u8; 32]).unwrap();
        host.renegotiate_size(Resolution::QVGA).unwrap();
        host.feed_frame(&[2u8; 32]).unwrap();
        host.disconnect();

        let mut sink = CollectSink::new();
        session.run(&mut sink).unwrap();

        assert_eq!(sink.frames.len(), 2);
        assert_eq!(sink.frames[0].1.size, Resolution::VGA);
        assert_eq!(sink.frames[1].1.size, Resolution::QVGA);
        assert_eq!(session.stats().formats_negotiated, 2);
    }

    // Feeds from a second thread once the stream is up, then hangs up.
    // Exercises the doorbell wakeup path instead of pre-queued events.
    #[test]
    fn test_run_capture_entry_point() {
        let transport = Transport::new();
        let host = std::sync::Arc::new(
            CaptureHost::new(
                &transport,
                HostConfig::default().with_format(PixelFormat::Rgbx),
            )
            .unwrap(),
        );
        let fd = host.remote_fd().unwrap();

        let feeder = {
            let host = host.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    if host.is_stream_connected() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                for i in 0..3u8 {
                    let _ = host.feed_frame(&[i; 48]);
                    thread::sleep(Duration::from_millis(2));
                }
                host.disconnect();
            })
        };

        let config = SessionConfig::default().with_node_id(host.node_id());
        let mut sink = CollectSink::new();
        let stats = run_capture(&transport, fd, config, &mut sink).unwrap();
        feeder.join().unwrap();

        assert_eq!(stats.exchange.forwarded, sink.frames.len() as u64);
        assert!(stats.formats_negotiated >= 1);
    }
}
