use crate::stream::stats::StatisticsCollector;
use byteorder::{ByteOrder, LittleEndian};
use dfc_types::StreamDirection;
use log::{debug, error, info};
use std::io::{ErrorKind, Read, Write};

/// The DAC takes the sample in the upper bits of each 16-bit word.
pub const DAC_SHIFT: u32 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferOutcome {
    Continue,
    EndOfStream,
}

pub struct CaptureTransform {
    sink: Option<Box<dyn Write + Send>>,
}

impl CaptureTransform {
    pub fn new(sink: Option<Box<dyn Write + Send>>) -> Self {
        Self { sink }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Accounts the received samples and forwards them to the sink. A sink
    /// that fails is dropped, the stream itself carries on.
    pub fn on_buffer_ready(
        &mut self,
        buffer: &[u8],
        stats: &mut StatisticsCollector,
    ) -> BufferOutcome {
        stats.record_capture(buffer);

        if let Some(sink) = self.sink.as_mut() {
            if let Err(error) = sink.write_all(buffer) {
                error!("Unable to write samples, detaching output: {}", error);
                self.sink = None;
            }
        }
        BufferOutcome::Continue
    }

    fn finish(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(error) = sink.flush() {
                error!("Unable to flush output: {}", error);
            }
        }
    }
}

pub struct PlaybackTransform {
    source: Option<Box<dyn Read + Send>>,
    staging: Vec<u8>,
}

impl PlaybackTransform {
    pub fn new(source: Box<dyn Read + Send>) -> Self {
        Self {
            source: Some(source),
            staging: Vec::new(),
        }
    }

    /// Refills `buffer` from the source. Each input sample becomes a 32-bit
    /// frame: a zero word, then the sample shifted up by `DAC_SHIFT`.
    pub fn on_buffer_ready(
        &mut self,
        buffer: &mut [u8],
        stats: &mut StatisticsCollector,
    ) -> BufferOutcome {
        let Some(source) = self.source.as_mut() else {
            return BufferOutcome::EndOfStream;
        };

        let wanted = buffer.len() / 2;
        self.staging.resize(wanted, 0);

        let mut filled = 0;
        while filled < wanted {
            match source.read(&mut self.staging[filled..]) {
                Ok(0) => {
                    info!("End of input reached, done streaming");
                    self.source = None;
                    return BufferOutcome::EndOfStream;
                }
                Ok(read) => filled += read,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => {
                    error!("Unable to read samples: {}", error);
                    self.source = None;
                    return BufferOutcome::EndOfStream;
                }
            }
        }

        for (frame, sample) in buffer
            .chunks_exact_mut(4)
            .zip(self.staging.chunks_exact(2))
        {
            let value = LittleEndian::read_i16(sample) << DAC_SHIFT;
            LittleEndian::write_i16(&mut frame[0..2], 0);
            LittleEndian::write_i16(&mut frame[2..4], value);
        }

        stats.record_playback(buffer.len(), wanted);
        BufferOutcome::Continue
    }
}

/// What happens to a buffer between two submissions of its transfer.
pub enum Transform {
    Capture(CaptureTransform),
    Playback(PlaybackTransform),
}

impl Transform {
    pub fn direction(&self) -> StreamDirection {
        match self {
            Transform::Capture(_) => StreamDirection::Capture,
            Transform::Playback(_) => StreamDirection::Playback,
        }
    }

    pub fn on_buffer_ready(
        &mut self,
        buffer: &mut [u8],
        stats: &mut StatisticsCollector,
    ) -> BufferOutcome {
        match self {
            Transform::Capture(capture) => capture.on_buffer_ready(buffer, stats),
            Transform::Playback(playback) => playback.on_buffer_ready(buffer, stats),
        }
    }

    pub fn finish(&mut self) {
        debug!("Finishing {} transform", self.direction());
        if let Transform::Capture(capture) = self {
            capture.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfc_types::Channel;
    use std::io::{self, Cursor};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn capture_forwards_to_the_sink() {
        let sink = SharedSink::default();
        let mut transform = Transform::Capture(CaptureTransform::new(Some(Box::new(sink.clone()))));
        let mut stats = StatisticsCollector::new(false);

        let mut buffer = [0x10, 0x00, 0xf0, 0xff];
        let outcome = transform.on_buffer_ready(&mut buffer, &mut stats);
        assert_eq!(outcome, BufferOutcome::Continue);
        assert_eq!(*sink.0.lock().unwrap(), buffer.to_vec());
        assert_eq!(stats.range(Channel::Even).max, 16);
        assert_eq!(stats.range(Channel::Odd).min, -16);
    }

    #[test]
    fn failing_sink_is_detached() {
        let mut capture = CaptureTransform::new(Some(Box::new(BrokenPipe)));
        let mut stats = StatisticsCollector::new(false);

        let outcome = capture.on_buffer_ready(&[1, 0], &mut stats);
        assert_eq!(outcome, BufferOutcome::Continue);
        assert!(!capture.has_sink());

        // Statistics keep flowing without a sink.
        capture.on_buffer_ready(&[2, 0], &mut stats);
        assert_eq!(stats.bytes_transferred(), 4);
    }

    #[test]
    fn playback_shifts_and_interleaves() {
        let input: Vec<u8> = [1i16, -1, 0x1000]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let mut playback = PlaybackTransform::new(Box::new(Cursor::new(input)));
        let mut stats = StatisticsCollector::new(false);

        let mut buffer = [0xaa; 8];
        assert_eq!(
            playback.on_buffer_ready(&mut buffer, &mut stats),
            BufferOutcome::Continue
        );
        assert_eq!(buffer, [0, 0, 4, 0, 0, 0, 0xfc, 0xff]);

        // Only half a buffer is left in the source.
        assert_eq!(
            playback.on_buffer_ready(&mut buffer, &mut stats),
            BufferOutcome::EndOfStream
        );
        assert_eq!(
            playback.on_buffer_ready(&mut buffer, &mut stats),
            BufferOutcome::EndOfStream
        );
        assert_eq!(stats.bytes_transferred(), 8);
    }

    #[test]
    fn shift_truncates_to_sixteen_bits() {
        let input = 0x4001i16.to_le_bytes().to_vec();
        let mut playback = PlaybackTransform::new(Box::new(Cursor::new(input)));
        let mut stats = StatisticsCollector::new(false);

        let mut buffer = [0; 4];
        playback.on_buffer_ready(&mut buffer, &mut stats);
        assert_eq!(LittleEndian::read_i16(&buffer[2..4]), 4);
    }
}
