use crate::stream::engine::StopReason;
use byteorder::{ByteOrder, LittleEndian};
use dfc_types::{Channel, StreamDirection};
use enum_map::EnumMap;
use log::info;
use std::io::Write;
use std::time::Duration;

pub const HISTOGRAM_BUCKETS: usize = 1 << 16;
const HISTOGRAM_OFFSET: i32 = 32768;

/// Smallest and largest sample seen. Starts inverted, so an empty range
/// reports `[32767, -32768]`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SampleRange {
    pub min: i16,
    pub max: i16,
}

impl Default for SampleRange {
    fn default() -> Self {
        Self {
            min: i16::MAX,
            max: i16::MIN,
        }
    }
}

impl SampleRange {
    fn record(&mut self, value: i16) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

#[derive(Clone, Debug)]
pub struct Histogram {
    counts: Vec<u64>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            counts: vec![0; HISTOGRAM_BUCKETS],
        }
    }
}

impl Histogram {
    fn record(&mut self, value: i16) {
        self.counts[(value as i32 + HISTOGRAM_OFFSET) as usize] += 1;
    }

    pub fn count(&self, value: i16) -> u64 {
        self.counts[(value as i32 + HISTOGRAM_OFFSET) as usize]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Every bucket between the lowest and highest non-empty one, as
    /// `(sample value, count)`.
    pub fn bins(&self) -> impl Iterator<Item = (i32, u64)> + '_ {
        let first = self.counts.iter().position(|&c| c > 0);
        let last = self.counts.iter().rposition(|&c| c > 0);
        let range = match (first, last) {
            (Some(first), Some(last)) => first..last + 1,
            _ => 0..0,
        };
        range.map(|bucket| (bucket as i32 - HISTOGRAM_OFFSET, self.counts[bucket]))
    }
}

#[derive(Debug, Default)]
pub struct StatisticsCollector {
    success_count: u64,
    failure_count: u64,
    bytes_transferred: u64,
    input_bytes: u64,
    ranges: EnumMap<Channel, SampleRange>,
    histograms: Option<EnumMap<Channel, Histogram>>,
}

impl StatisticsCollector {
    pub fn new(histograms: bool) -> Self {
        Self {
            histograms: histograms.then(EnumMap::default),
            ..Default::default()
        }
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }

    /// Accounts a received buffer of interleaved little-endian samples, even
    /// indexes on one channel and odd on the other.
    pub fn record_capture(&mut self, buffer: &[u8]) {
        self.bytes_transferred += buffer.len() as u64;

        for (index, sample) in buffer.chunks_exact(2).enumerate() {
            let value = LittleEndian::read_i16(sample);
            let channel = Channel::for_sample_index(index);
            self.ranges[channel].record(value);
            if let Some(histograms) = self.histograms.as_mut() {
                histograms[channel].record(value);
            }
        }
    }

    pub fn record_playback(&mut self, transferred: usize, consumed: usize) {
        self.bytes_transferred += transferred as u64;
        self.input_bytes += consumed as u64;
    }

    pub fn success_count(&self) -> u64 {
        self.success_count
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn range(&self, channel: Channel) -> SampleRange {
        self.ranges[channel]
    }

    pub fn histogram(&self, channel: Channel) -> Option<&Histogram> {
        self.histograms.as_ref().map(|histograms| &histograms[channel])
    }

    pub fn snapshot(
        &self,
        direction: StreamDirection,
        duration: Duration,
        stop_reason: Option<StopReason>,
    ) -> StreamStats {
        let capture = (direction == StreamDirection::Capture).then(|| CaptureStats {
            ranges: self.ranges,
            histogram_totals: self
                .histograms
                .as_ref()
                .map(|histograms| EnumMap::from_fn(|channel| histograms[channel].total())),
        });
        let playback = (direction == StreamDirection::Playback).then_some(PlaybackStats {
            input_bytes: self.input_bytes,
        });

        StreamStats {
            direction,
            duration,
            success_count: self.success_count,
            failure_count: self.failure_count,
            bytes_transferred: self.bytes_transferred,
            stop_reason,
            capture,
            playback,
        }
    }

    /// Writes the per-channel histogram report. Channels without samples are
    /// skipped.
    pub fn write_histograms<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let Some(histograms) = self.histograms.as_ref() else {
            return Ok(());
        };

        for (channel, histogram) in histograms.iter() {
            let mut bins = histogram.bins().peekable();
            if bins.peek().is_none() {
                continue;
            }
            writeln!(writer, "# {} samples histogram", channel)?;
            for (value, count) in bins {
                writeln!(writer, "{}\t{}", value, count)?;
            }
            writeln!(writer)?;
        }
        writer.flush()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStats {
    pub ranges: EnumMap<Channel, SampleRange>,
    pub histogram_totals: Option<EnumMap<Channel, u64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackStats {
    pub input_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamStats {
    pub direction: StreamDirection,
    pub duration: Duration,
    pub success_count: u64,
    pub failure_count: u64,
    pub bytes_transferred: u64,
    pub stop_reason: Option<StopReason>,
    pub capture: Option<CaptureStats>,
    pub playback: Option<PlaybackStats>,
}

impl StreamStats {
    /// Throughput in kB/s.
    pub fn transfer_rate(&self) -> f64 {
        let seconds = self.duration.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / seconds / 1024.0
    }

    pub fn log(&self) {
        info!("{} stopped: {:?}", self.direction, self.stop_reason);
        info!("Successful transfers: {}", self.success_count);
        info!("Failed transfers: {}", self.failure_count);
        info!(
            "Transferred {} bytes in {:.3} seconds at {:.1} kB/s",
            self.bytes_transferred,
            self.duration.as_secs_f64(),
            self.transfer_rate()
        );

        if let Some(capture) = &self.capture {
            for (channel, range) in capture.ranges.iter() {
                info!("{} samples range: [{}, {}]", channel, range.min, range.max);
            }
            if let Some(totals) = &capture.histogram_totals {
                for (channel, total) in totals.iter() {
                    info!("{} histogram samples: {}", channel, total);
                }
            }
        }
        if let Some(playback) = &self.playback {
            info!("Input bytes consumed: {}", playback.input_bytes);
        }
    }
}
