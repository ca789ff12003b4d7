//! Frame buffer exchange
//!
//! Pulls ready buffers out of the stream, validates them and forwards each
//! usable frame to the sink exactly once. Buffers travel as leases, so the
//! pool gets its slot back on every path out of here, including a sink
//! that returns an error or panics.

use serde::Serialize;
use tracing::trace;

use crate::capture::buffer::FrameBuffer;
use crate::capture::format::VideoFormat;
use crate::error::Result;
use crate::service::link::StreamHandle;
use crate::utils::LogThrottler;

/// Receives validated frames from the exchange
pub trait FrameSink {
    /// Handle one forwarded frame
    ///
    /// The buffer is only valid for the duration of the call; the sink must
    /// copy whatever it needs to keep.
    fn deliver_frame(
        &mut self,
        node_id: u32,
        format: &VideoFormat,
        buffer: &FrameBuffer,
    ) -> Result<()>;
}

/// Per-session exchange counters
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExchangeStats {
    /// Frames handed to the sink
    pub forwarded: u64,
    /// Process events with nothing to dequeue
    pub no_buffer: u64,
    /// Buffers without mapped plane memory
    pub empty: u64,
    /// Buffers whose plane was not readable
    pub unreadable: u64,
    /// Frames dropped because no format was negotiated yet
    pub not_negotiated: u64,
    /// Frames the sink failed on
    pub sink_errors: u64,
}

/// Dequeues, validates and forwards frames for one stream
pub struct FrameBufferExchange {
    node_id: u32,
    throttler: LogThrottler,
    stats: ExchangeStats,
}

impl FrameBufferExchange {
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            throttler: LogThrottler::default(),
            stats: ExchangeStats::default(),
        }
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    /// Handle one process event
    ///
    /// Skipped frames are counted and logged with throttling; they never
    /// reach the sink and their buffers return to the pool regardless.
    pub fn process(
        &mut self,
        stream: &StreamHandle,
        format: Option<&VideoFormat>,
        sink: &mut dyn FrameSink,
    ) {
        let Some(lease) = stream.dequeue_buffer() else {
            self.stats.no_buffer += 1;
            crate::warn_throttled!(
                self.throttler,
                "no_buffer",
                "out of buffers, nothing to dequeue"
            );
            return;
        };
        self.throttler.clear("no_buffer");

        if lease.planes().len() > 1 {
            crate::warn_throttled!(
                self.throttler,
                "multi_plane",
                "buffer carries {} data planes, only the first is used",
                lease.planes().len()
            );
        }

        let Some(plane) = lease.primary() else {
            self.stats.empty += 1;
            crate::warn_throttled!(self.throttler, "empty_buffer", "skipping empty buffer");
            return;
        };
        if plane.data.is_none() {
            self.stats.empty += 1;
            crate::warn_throttled!(self.throttler, "empty_buffer", "skipping empty buffer");
            return;
        }
        if !plane.readable {
            self.stats.unreadable += 1;
            crate::warn_throttled!(
                self.throttler,
                "unreadable",
                "buffer plane is not readable, skipping"
            );
            return;
        }

        let Some(format) = format else {
            self.stats.not_negotiated += 1;
            crate::debug_throttled!(
                self.throttler,
                "no_format",
                "process event before format negotiation, dropping frame"
            );
            return;
        };

        trace!("got a frame of size {}", plane.chunk.size);

        if let Err(e) = sink.deliver_frame(self.node_id, format, &lease) {
            self.stats.sink_errors += 1;
            crate::error_throttled!(self.throttler, "sink", "frame sink failed: {}", e);
            return;
        }
        self.stats.forwarded += 1;
    }
}
