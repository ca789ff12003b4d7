//! In-process capture service host
//!
//! The service side of a capture link: owns the socket pair, the buffer
//! pool, stream acceptance and format fixation. A production deployment
//! points the session at a compositor's capture service; this host stands
//! in for one, so relays can run against synthetic frames and tests can
//! steer every edge of the stream protocol.

use std::cmp::Ordering;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use bytes::Bytes;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use parking_lot::Mutex;
use tracing::debug;

use crate::capture::buffer::DataPlane;
use crate::capture::format::{Fraction, PixelFormat, Resolution, VideoFormat};
use crate::capture::params::{MediaSubtype, MediaType, ParamId, ParamObject, PropKey, Value};
use crate::error::{RelayError, Result};
use crate::service::link::{PoolStats, Shared, StreamEvent, StreamProperties, Transport};

/// Capture service host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Node id the service exposes for capture
    pub node_id: u32,
    /// Pixel format the service produces
    pub format: PixelFormat,
    /// Frame size the service produces
    pub size: Resolution,
    /// Upper bound on frames per second the service produces
    pub fps: u32,
    /// Number of pool buffers shared with the session
    pub buffers: usize,
    /// Whether stream connect requests are accepted
    pub accept_streams: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            format: PixelFormat::Bgrx,
            size: Resolution::VGA,
            fps: 60,
            buffers: 4,
            accept_streams: true,
        }
    }
}

impl HostConfig {
    pub fn with_node_id(mut self, node_id: u32) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_size(mut self, size: Resolution) -> Self {
        self.size = size;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_accept_streams(mut self, accept: bool) -> Self {
        self.accept_streams = accept;
        self
    }

    /// Pick a concrete format from an offered enumeration
    ///
    /// The host keeps its own pixel format, clamps its frame size into the
    /// offered bounds and lowers its rate to the offered maximum. Returns
    /// `None` when no offer matches what this host produces.
    pub(crate) fn fixate(&self, params: &[ParamObject]) -> Option<VideoFormat> {
        let offer = params.iter().find(|p| p.id() == ParamId::EnumFormat)?;
        let (media_type, media_subtype) = offer.media_identity()?;
        if media_type != MediaType::Video || media_subtype != MediaSubtype::Raw {
            return None;
        }

        let wanted = self.format.to_raw();
        if !offer.id_candidates(PropKey::VideoFormat).contains(&wanted) {
            return None;
        }

        let (_, min, max) = offer.rectangle_bounds(PropKey::VideoSize)?;
        let size = Resolution::new(
            self.size.width.clamp(min.width, max.width),
            self.size.height.clamp(min.height, max.height),
        );

        let (_, rate_min, rate_max) = offer.fraction_bounds(PropKey::VideoFramerate)?;
        let mut framerate = Fraction::new(self.fps, 1);
        if framerate.rate_cmp(&rate_max) == Ordering::Greater {
            framerate = rate_max;
        }
        if framerate.rate_cmp(&rate_min) == Ordering::Less {
            framerate = rate_min;
        }

        let format = VideoFormat::new(self.format, size, framerate);
        format.is_valid().then_some(format)
    }
}

/// Build the fixated format object announced to the session
pub(crate) fn format_param(format: &VideoFormat) -> ParamObject {
    ParamObject::new(ParamId::Format)
        .with(PropKey::MediaType, Value::Id(MediaType::Video.to_raw()))
        .with(PropKey::MediaSubtype, Value::Id(MediaSubtype::Raw.to_raw()))
        .with(PropKey::VideoFormat, Value::Id(format.pixel_format.to_raw()))
        .with(PropKey::VideoSize, Value::Rectangle(format.size))
        .with(PropKey::VideoFramerate, Value::Fraction(format.framerate))
}

/// The service end of a capture link
pub struct CaptureHost {
    shared: Arc<Shared>,
    transport: Transport,
    key: RawFd,
    remote: Mutex<Option<OwnedFd>>,
}

impl CaptureHost {
    /// Create a host and bind it into the transport
    pub fn new(transport: &Transport, config: HostConfig) -> Result<Self> {
        let (host_end, session_end) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| RelayError::Transport(format!("socketpair failed: {}", e)))?;

        let doorbell = UnixStream::from(host_end);
        doorbell
            .set_nonblocking(true)
            .map_err(|e| RelayError::Transport(format!("cannot prepare doorbell: {}", e)))?;

        let key = session_end.as_raw_fd();
        let shared = Arc::new(Shared::new(config, doorbell));
        transport.bind(key, shared.clone());
        debug!("capture host bound to fd {}", key);

        Ok(Self {
            shared,
            transport: transport.clone(),
            key,
            remote: Mutex::new(Some(session_end)),
        })
    }

    /// Take the session-side handle
    ///
    /// The handle can only be taken once; it is what a supervising process
    /// would pass down to the capture session.
    pub fn remote_fd(&self) -> Result<OwnedFd> {
        self.remote
            .lock()
            .take()
            .ok_or_else(|| RelayError::Transport("capture handle already taken".into()))
    }

    pub fn node_id(&self) -> u32 {
        self.shared.state.lock().host.node_id
    }

    /// Format fixated for the connected stream, if any
    pub fn negotiated_format(&self) -> Option<VideoFormat> {
        self.shared.state.lock().negotiated
    }

    /// Properties the session attached to its stream, if one was created
    pub fn stream_properties(&self) -> Option<StreamProperties> {
        self.shared.state.lock().stream_props.clone()
    }

    pub fn is_session_connected(&self) -> bool {
        self.shared.state.lock().session_connected
    }

    pub fn is_stream_connected(&self) -> bool {
        self.shared.state.lock().stream_connected
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.state.lock().pool.stats()
    }

    /// Stage one frame and signal the session
    ///
    /// Returns `Ok(false)` when every pool buffer is in flight; the frame
    /// is dropped, matching a capture source outrunning its consumer.
    pub fn feed_frame(&self, pixels: &[u8]) -> Result<bool> {
        self.feed_frame_bytes(Bytes::copy_from_slice(pixels))
    }

    /// Stage one frame without copying and signal the session
    pub fn feed_frame_bytes(&self, pixels: Bytes) -> Result<bool> {
        let stride = {
            let st = self.shared.state.lock();
            if !st.stream_connected {
                return Err(RelayError::Transport("stream is not connected".into()));
            }
            match st.negotiated {
                Some(format) => format.pixel_format.row_stride(format.size.width) as u32,
                None => 0,
            }
        };
        self.feed_plane(DataPlane::filled(pixels, stride))
    }

    /// Stage an arbitrary plane as one frame and signal the session
    pub fn feed_plane(&self, plane: DataPlane) -> Result<bool> {
        let mut st = self.shared.state.lock();
        if !st.stream_connected {
            return Err(RelayError::Transport("stream is not connected".into()));
        }
        if st.pool.stage(vec![plane]).is_none() {
            return Ok(false);
        }
        st.events.push_back(StreamEvent::Process);
        self.shared.ring();
        Ok(true)
    }

    /// Stage a frame whose plane has no mapped memory
    pub fn feed_empty_frame(&self) -> Result<bool> {
        self.feed_plane(DataPlane::empty())
    }

    /// Signal a process event without staging a frame
    ///
    /// Models a wakeup racing the pool, which leaves the session with
    /// nothing to dequeue.
    pub fn signal_process(&self) -> Result<()> {
        let mut st = self.shared.state.lock();
        if !st.stream_connected {
            return Err(RelayError::Transport("stream is not connected".into()));
        }
        st.events.push_back(StreamEvent::Process);
        self.shared.ring();
        Ok(())
    }

    /// Report an asynchronous service error to the session
    pub fn report_error(&self, message: impl Into<String>) -> Result<()> {
        let mut st = self.shared.state.lock();
        if !st.session_connected {
            return Err(RelayError::Transport("no session is connected".into()));
        }
        st.error_seq += 1;
        let seq = st.error_seq;
        st.events.push_back(StreamEvent::CoreError {
            seq,
            message: message.into(),
        });
        self.shared.ring();
        Ok(())
    }

    /// Fixate a new frame size for the connected stream
    ///
    /// Announces the updated format to the session. Frames staged after
    /// this call must already use the new size.
    pub fn renegotiate_size(&self, size: Resolution) -> Result<()> {
        if !size.is_valid() {
            return Err(RelayError::Transport(format!("size {} is out of range", size)));
        }
        let mut st = self.shared.state.lock();
        if !st.stream_connected {
            return Err(RelayError::Transport("stream is not connected".into()));
        }
        let Some(mut format) = st.negotiated else {
            return Err(RelayError::Transport("no negotiated format".into()));
        };
        format.size = size;
        st.negotiated = Some(format);
        st.events.push_back(StreamEvent::ParamChanged {
            id: ParamId::Format,
            param: Some(format_param(&format)),
        });
        self.shared.ring();
        Ok(())
    }

    /// Stop serving
    ///
    /// The session drains every queued event and then observes the hangup.
    pub fn disconnect(&self) {
        let mut st = self.shared.state.lock();
        if st.host_disconnected {
            return;
        }
        st.host_disconnected = true;
        self.shared.ring();
    }
}

impl Drop for CaptureHost {
    fn drop(&mut self) {
        self.disconnect();
        self.transport.unbind(self.key);
    }
}
