//! Transport link between a capture session and its service
//!
//! A service binds the service end of a socket pair into the [`Transport`]
//! and hands the other end to the process that runs the session. The socket
//! carries no payload: the service pushes events into a shared queue and
//! writes a doorbell byte, the session polls its end and drains the queue
//! on its own thread. Frames move through a shared buffer pool; a dequeued
//! buffer is held as a [`BufferLease`] that requeues itself when dropped,
//! so the pool recovers on every exit path including panics.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::ops::Deref;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::capture::buffer::{DataPlane, FrameBuffer};
use crate::capture::format::VideoFormat;
use crate::capture::params::{ParamId, ParamObject};
use crate::error::{RelayError, Result};
use crate::service::host::{self, HostConfig};

/// Events delivered to the session by the capture service
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A stream parameter changed; `param` is absent when the service
    /// cleared it
    ParamChanged {
        id: ParamId,
        param: Option<ParamObject>,
    },
    /// A buffer is ready for dequeueing
    Process,
    /// Asynchronous service error, informational for the session
    CoreError { seq: u32, message: String },
}

/// Descriptive properties attached to a stream at creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProperties {
    pub media_type: String,
    pub media_category: String,
    pub media_role: String,
    pub name: String,
}

impl StreamProperties {
    /// Properties describing a screen capture consumer
    pub fn screen_capture(name: impl Into<String>) -> Self {
        Self {
            media_type: "Video".to_string(),
            media_category: "Capture".to_string(),
            media_role: "Screen".to_string(),
            name: name.into(),
        }
    }
}

/// Data direction of a stream relative to the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The session consumes frames
    Input,
    /// The session produces frames
    Output,
}

/// Stream connect options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// Let the service pick and wire the target automatically
    pub autoconnect: bool,
    /// Map buffer memory into the session
    pub map_buffers: bool,
}

impl StreamFlags {
    /// Autoconnected stream with mapped buffers, the capture default
    pub const fn autoconnect_mapped() -> Self {
        Self {
            autoconnect: true,
            map_buffers: true,
        }
    }
}

/// Buffer pool counters, observable on the service side
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub free: usize,
    pub ready: usize,
    pub leased: usize,
    /// Buffers returned to the pool by the session
    pub requeued: u64,
    /// Frames the service dropped because no buffer was free
    pub starved: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Ready,
    Leased,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    content: FrameBuffer,
}

/// Fixed set of frame buffers shared between service and session
#[derive(Debug)]
pub(crate) struct Pool {
    slots: Vec<Slot>,
    ready: VecDeque<usize>,
    requeued: u64,
    starved: u64,
}

impl Pool {
    pub(crate) fn new(buffers: usize) -> Self {
        let slots = (0..buffers)
            .map(|i| Slot {
                state: SlotState::Free,
                content: FrameBuffer::new(i as u32, Vec::new()),
            })
            .collect();
        Self {
            slots,
            ready: VecDeque::new(),
            requeued: 0,
            starved: 0,
        }
    }

    /// Fill a free slot and queue it for the session
    pub(crate) fn stage(&mut self, planes: Vec<DataPlane>) -> Option<usize> {
        let idx = match self.slots.iter().position(|s| s.state == SlotState::Free) {
            Some(idx) => idx,
            None => {
                self.starved += 1;
                return None;
            }
        };
        self.slots[idx].content = FrameBuffer::new(idx as u32, planes);
        self.slots[idx].state = SlotState::Ready;
        self.ready.push_back(idx);
        Some(idx)
    }

    /// Hand out the oldest ready buffer
    fn dequeue(&mut self) -> Option<(usize, FrameBuffer)> {
        let idx = self.ready.pop_front()?;
        self.slots[idx].state = SlotState::Leased;
        Some((idx, self.slots[idx].content.clone()))
    }

    /// Return a leased slot to the free set
    fn release(&mut self, idx: usize) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        if slot.state == SlotState::Leased {
            slot.state = SlotState::Free;
            slot.content = FrameBuffer::new(idx as u32, Vec::new());
            self.requeued += 1;
        }
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            requeued: self.requeued,
            starved: self.starved,
            ..PoolStats::default()
        };
        for slot in &self.slots {
            match slot.state {
                SlotState::Free => stats.free += 1,
                SlotState::Ready => stats.ready += 1,
                SlotState::Leased => stats.leased += 1,
            }
        }
        stats
    }
}

/// State shared between the service host and the session-side handles
#[derive(Debug)]
pub(crate) struct SharedState {
    pub(crate) host: HostConfig,
    pub(crate) session_connected: bool,
    pub(crate) stream_connected: bool,
    pub(crate) host_disconnected: bool,
    pub(crate) stream_props: Option<StreamProperties>,
    pub(crate) stream_flags: StreamFlags,
    pub(crate) negotiated: Option<VideoFormat>,
    pub(crate) error_seq: u32,
    pub(crate) events: VecDeque<StreamEvent>,
    pub(crate) pool: Pool,
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) state: Mutex<SharedState>,
    doorbell: UnixStream,
}

impl Shared {
    pub(crate) fn new(host: HostConfig, doorbell: UnixStream) -> Self {
        Self {
            state: Mutex::new(SharedState {
                host,
                session_connected: false,
                stream_connected: false,
                host_disconnected: false,
                stream_props: None,
                stream_flags: StreamFlags::default(),
                negotiated: None,
                error_seq: 0,
                events: VecDeque::new(),
                pool: Pool::new(0),
            }),
            doorbell,
        }
    }

    fn pop_event(&self) -> Option<StreamEvent> {
        self.state.lock().events.pop_front()
    }

    /// Wake a session blocked in `wait_event`. Callers must hold the state
    /// lock so the wake cannot race a link teardown.
    pub(crate) fn ring(&self) {
        let _ = (&self.doorbell).write(&[1]);
    }

    fn release(&self, slot: usize) {
        self.state.lock().pool.release(slot);
    }
}

/// Process-wide transport through which capture services expose handles
///
/// `connect` resolves an inherited handle back to the service that bound
/// it. Handles that were never bound, or whose service has gone away, do
/// not connect.
#[derive(Clone, Default)]
pub struct Transport {
    registry: Arc<Registry>,
}

#[derive(Default)]
struct Registry {
    endpoints: Mutex<HashMap<RawFd, Arc<Shared>>>,
}

impl Transport {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bind(&self, key: RawFd, shared: Arc<Shared>) {
        self.registry.endpoints.lock().insert(key, shared);
    }

    pub(crate) fn unbind(&self, key: RawFd) {
        self.registry.endpoints.lock().remove(&key);
    }

    fn lookup(&self, key: RawFd) -> Option<Arc<Shared>> {
        self.registry.endpoints.lock().get(&key).cloned()
    }

    /// Connect to the capture service behind an inherited handle
    ///
    /// Takes ownership of the handle. Each handle binds at most one
    /// session for its lifetime.
    pub fn connect(&self, fd: OwnedFd) -> Result<ServiceLink> {
        let raw = fd.as_raw_fd();
        let shared = self
            .lookup(raw)
            .ok_or_else(|| RelayError::Connect(format!("no capture service bound to fd {}", raw)))?;

        let sock = UnixStream::from(fd);
        sock.set_nonblocking(true)
            .map_err(|e| RelayError::Connect(format!("cannot prepare fd {}: {}", raw, e)))?;

        {
            let mut st = shared.state.lock();
            if st.host_disconnected {
                return Err(RelayError::Connect("capture service is shut down".into()));
            }
            if st.session_connected {
                return Err(RelayError::Connect(
                    "handle is already bound to a session".into(),
                ));
            }
            st.session_connected = true;
        }

        debug!("connected to capture service on fd {}", raw);
        Ok(ServiceLink {
            shared,
            sock: Arc::new(sock),
        })
    }
}

/// Session side of a connected capture link
#[derive(Debug)]
pub struct ServiceLink {
    shared: Arc<Shared>,
    sock: Arc<UnixStream>,
}

impl ServiceLink {
    /// Create a stream on this link
    pub fn create_stream(&self, props: StreamProperties) -> StreamHandle {
        debug!("created stream \"{}\"", props.name);
        self.shared.state.lock().stream_props = Some(props);
        StreamHandle {
            shared: self.shared.clone(),
            sock: self.sock.clone(),
        }
    }
}

impl Drop for ServiceLink {
    fn drop(&mut self) {
        let mut st = self.shared.state.lock();
        st.session_connected = false;
        st.stream_connected = false;
    }
}

/// A stream created on a capture link
pub struct StreamHandle {
    shared: Arc<Shared>,
    sock: Arc<UnixStream>,
}

impl StreamHandle {
    /// Ask the service to wire this stream to a node
    ///
    /// On success the service has fixated a format and queued the matching
    /// parameter event; the format arrives before any process event.
    pub fn connect(
        &self,
        node_id: u32,
        direction: Direction,
        flags: StreamFlags,
        params: Vec<ParamObject>,
    ) -> Result<()> {
        let mut st = self.shared.state.lock();
        if !st.session_connected {
            return Err(RelayError::StreamConnect("link is closed".into()));
        }
        if st.host_disconnected {
            return Err(RelayError::StreamConnect(
                "capture service is shut down".into(),
            ));
        }
        if st.stream_connected {
            return Err(RelayError::StreamConnect(
                "stream is already connected".into(),
            ));
        }
        if direction != Direction::Input {
            return Err(RelayError::StreamConnect(
                "capture service only serves input streams".into(),
            ));
        }
        if !st.host.accept_streams {
            return Err(RelayError::StreamConnect(
                "stream connect refused by capture service".into(),
            ));
        }
        if node_id != st.host.node_id {
            return Err(RelayError::StreamConnect(format!("unknown node {}", node_id)));
        }

        let fixated = st
            .host
            .fixate(&params)
            .ok_or_else(|| RelayError::StreamConnect("no acceptable format offered".into()))?;

        st.pool = Pool::new(st.host.buffers);
        st.stream_flags = flags;
        st.events.push_back(StreamEvent::ParamChanged {
            id: ParamId::Format,
            param: Some(host::format_param(&fixated)),
        });
        st.negotiated = Some(fixated);
        st.stream_connected = true;
        Ok(())
    }

    /// Block until the service delivers the next event
    ///
    /// Returns `Ok(None)` once the service has hung up and every queued
    /// event has been delivered.
    pub fn wait_event(&self) -> Result<Option<StreamEvent>> {
        loop {
            if let Some(event) = self.shared.pop_event() {
                return Ok(Some(event));
            }
            if self.shared.state.lock().host_disconnected {
                return Ok(None);
            }

            let mut fds = [PollFd::new(self.sock.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(RelayError::Transport(format!("event poll failed: {}", e))),
            }

            if !self.drain_doorbell()? {
                // The peer end closed. Deliver whatever is still queued and
                // report the hangup once the queue is empty.
                return Ok(self.shared.pop_event());
            }
        }
    }

    /// Drain pending doorbell bytes. Returns false when the peer closed.
    fn drain_doorbell(&self) -> Result<bool> {
        let mut buf = [0u8; 64];
        loop {
            match (&*self.sock).read(&mut buf) {
                Ok(0) => return Ok(false),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(RelayError::Transport(format!("doorbell read failed: {}", e)))
                }
            }
        }
    }

    /// Take the oldest ready buffer out of the pool
    ///
    /// Returns `None` when the pool has nothing ready, which the session
    /// treats as a transient out-of-buffers condition.
    pub fn dequeue_buffer(&self) -> Option<BufferLease> {
        let mut st = self.shared.state.lock();
        let (slot, buffer) = st.pool.dequeue()?;
        Some(BufferLease {
            shared: self.shared.clone(),
            slot,
            buffer,
        })
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shared.state.lock().stream_connected = false;
    }
}

/// A dequeued buffer, returned to the pool on drop
pub struct BufferLease {
    shared: Arc<Shared>,
    slot: usize,
    buffer: FrameBuffer,
}

impl Deref for BufferLease {
    type Target = FrameBuffer;

    fn deref(&self) -> &FrameBuffer {
        &self.buffer
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.shared.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    fn plane(byte: u8) -> DataPlane {
        DataPlane::filled(Bytes::copy_from_slice(&[byte; 16]), 16)
    }

    #[test]
    fn test_pool_stage_dequeue_release() {
        let mut pool = Pool::new(2);
        assert_eq!(pool.stats().free, 2);

        let idx = pool.stage(vec![plane(1)]).unwrap();
        assert_eq!(pool.stats().ready, 1);

        let (slot, buffer) = pool.dequeue().unwrap();
        assert_eq!(slot, idx);
        assert_eq!(buffer.id(), idx as u32);
        assert!(buffer.primary().is_some());
        assert_eq!(pool.stats().leased, 1);

        pool.release(slot);
        let stats = pool.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.requeued, 1);
    }

    #[test]
    fn test_pool_starves_when_full() {
        let mut pool = Pool::new(1);
        assert!(pool.stage(vec![plane(1)]).is_some());
        assert!(pool.stage(vec![plane(2)]).is_none());
        assert_eq!(pool.stats().starved, 1);

        // Ready but not dequeued still occupies the slot
        assert!(pool.stage(vec![plane(3)]).is_none());
        assert_eq!(pool.stats().starved, 2);
    }

    #[test]
    fn test_pool_dequeue_order_is_fifo() {
        let mut pool = Pool::new(3);
        pool.stage(vec![plane(1)]);
        pool.stage(vec![plane(2)]);

        let (_, first) = pool.dequeue().unwrap();
        let (_, second) = pool.dequeue().unwrap();
        let first_byte = first.primary().unwrap().data.as_ref().unwrap()[0];
        let second_byte = second.primary().unwrap().data.as_ref().unwrap()[0];
        assert_eq!(first_byte, 1);
        assert_eq!(second_byte, 2);
        assert!(pool.dequeue().is_none());
    }

    #[test]
    fn test_pool_release_ignores_non_leased_slots() {
        let mut pool = Pool::new(1);
        pool.stage(vec![plane(1)]);
        // Releasing a ready slot or an out-of-range index changes nothing
        pool.release(0);
        pool.release(9);
        assert_eq!(pool.stats().ready, 1);
        assert_eq!(pool.stats().requeued, 0);
    }

    #[test]
    fn test_connect_unknown_fd_fails() {
        let transport = Transport::new();
        let (ours, _theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();

        let err = transport.connect(ours).unwrap_err();
        assert!(matches!(err, RelayError::Connect(_)));
        assert_eq!(err.exit_code(), -2);
    }

    #[test]
    fn test_screen_capture_properties() {
        let props = StreamProperties::screen_capture("test stream");
        assert_eq!(props.media_type, "Video");
        assert_eq!(props.media_category, "Capture");
        assert_eq!(props.media_role, "Screen");
        assert_eq!(props.name, "test stream");
    }

    #[test]
    fn test_stream_flags() {
        let flags = StreamFlags::autoconnect_mapped();
        assert!(flags.autoconnect);
        assert!(flags.map_buffers);
        assert_eq!(StreamFlags::default(), StreamFlags { autoconnect: false, map_buffers: false });
    }
}
