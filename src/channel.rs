//! Segmented per-channel time series.
//!
//! Each channel keeps one segment per recording run. A run starts with
//! [`ChannelBank::new_segment`] and every sample of that run is appended to the
//! last segment. All channels of a bank start and stop together, so they always
//! hold the same number of segments.

use serde::Serialize;

use crate::errors::{DriverError, Result};

/// One timestamped value. `t` is seconds since the first start after a clear.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub t: f64,
    pub v: f64,
}

pub type Segment = Vec<Sample>;

/// Storage for a single channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelBuffer {
    segments: Vec<Segment>,
}

impl ChannelBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_segment(&mut self) {
        self.segments.push(Segment::new());
    }

    /// Append to the current segment. Fails if no run was ever started.
    pub fn append(&mut self, t: f64, v: f64) -> Result<()> {
        let segment = self.segments.last_mut().ok_or_else(|| {
            DriverError::InvalidState("append without an active segment".into())
        })?;
        segment.push(Sample { t, v });
        Ok(())
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// The segment currently being recorded (or last recorded).
    pub fn active_segment(&self) -> &[Sample] {
        self.segments.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn sample_count(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }
}

/// The fixed set of channels of one device.
#[derive(Debug, Clone)]
pub struct ChannelBank {
    channels: Vec<ChannelBuffer>,
}

impl ChannelBank {
    pub fn new(count: usize) -> Self {
        Self {
            channels: vec![ChannelBuffer::new(); count],
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ChannelBuffer> {
        self.channels.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelBuffer> {
        self.channels.iter()
    }

    /// Open a new segment on every channel.
    pub fn new_segment(&mut self) {
        self.channels.iter_mut().for_each(ChannelBuffer::new_segment);
    }

    pub fn append(&mut self, index: usize, t: f64, v: f64) -> Result<()> {
        let count = self.channels.len();
        self.channels
            .get_mut(index)
            .ok_or_else(|| {
                DriverError::InvalidState(format!("channel {index} out of range (0..{count})"))
            })?
            .append(t, v)
    }

    pub fn clear(&mut self) {
        self.channels.iter_mut().for_each(ChannelBuffer::clear);
    }

    /// Segment count shared by all channels.
    pub fn segment_count(&self) -> usize {
        self.channels.first().map_or(0, ChannelBuffer::segment_count)
    }

    pub fn has_data(&self) -> bool {
        self.segment_count() > 0
    }
}
