//! Incremental readout of the electrometer sample buffer.
//!
//! The instrument keeps every sample of the running acquisition. The cursor
//! remembers how many were already consumed so each poll fetches only the new
//! slice, converts it with the channel formulas and stores it as a
//! [`ReadoutBuffer`].

use crate::em2::Em2Client;
use crate::error::Em2Error;
use crate::formula::FormulaRegistry;
use crate::types::{Reading, SyncMode};
use log::debug;
use ndarray::{Array2, ArrayView1};

/// Converted samples of one poll.
///
/// Row 0 holds the integration time of every sample; row `n` holds the
/// converted values of instrument channel `n`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadoutBuffer {
    data: Array2<f64>,
}

impl ReadoutBuffer {
    /// Assemble the buffer from converted channel rows.
    pub fn assemble(integration_time: f64, channels: Vec<Vec<f64>>) -> Result<Self, Em2Error> {
        let samples = channels.first().map(Vec::len).unwrap_or(0);
        let mut data = Array2::<f64>::zeros((channels.len() + 1, samples));
        data.row_mut(0).fill(integration_time);
        for (i, values) in channels.iter().enumerate() {
            if values.len() != samples {
                return Err(Em2Error::Protocol(format!(
                    "Channel {} returned {} samples, expected {samples}",
                    i + 1,
                    values.len()
                )));
            }
            data.row_mut(i + 1).assign(&ArrayView1::from(values.as_slice()));
        }
        Ok(Self { data })
    }

    /// Number of samples in the slice.
    pub fn samples(&self) -> usize {
        self.data.ncols()
    }

    /// Number of measurement channels.
    pub fn channels(&self) -> usize {
        self.data.nrows() - 1
    }

    pub fn time(&self) -> ArrayView1<'_, f64> {
        self.data.row(0)
    }

    /// Row by index: 0 is time, `n` is instrument channel `n`.
    pub fn row(&self, index: usize) -> Option<ArrayView1<'_, f64>> {
        (index < self.data.nrows()).then(|| self.data.row(index))
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.data.rows().into_iter().map(|row| row.to_vec()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ReadoutCursor {
    index: u64,
    repetitions: u64,
    integration_time: f64,
    sync_mode: SyncMode,
    last: Option<ReadoutBuffer>,
}

impl Default for ReadoutCursor {
    fn default() -> Self {
        Self {
            index: 0,
            repetitions: 1,
            integration_time: 0.0,
            sync_mode: SyncMode::default(),
            last: None,
        }
    }
}

impl ReadoutCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new cycle with the parameters the acquisition was armed with.
    pub fn arm(&mut self, integration_time: f64, repetitions: u64, sync_mode: SyncMode) {
        self.integration_time = integration_time;
        self.repetitions = repetitions;
        self.sync_mode = sync_mode;
        self.reset();
    }

    /// Forget consumed samples and the last slice.
    pub fn reset(&mut self) {
        self.index = 0;
        self.last = None;
    }

    /// Number of samples already consumed.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Multi-sample acquisitions advance the cursor; single-shot ones re-read
    /// the latest sample every time.
    pub fn is_continuous(&self) -> bool {
        self.repetitions != 1
    }

    pub fn buffer(&self) -> Option<&ReadoutBuffer> {
        self.last.as_ref()
    }

    /// Fetch and convert samples that arrived since the last poll.
    ///
    /// # Returns
    /// Number of samples in the new slice, 0 if nothing new was ready.
    ///
    /// # Errors
    /// Parse and conversion failures are wrapped in `Em2Error::Readout`; the
    /// cursor is left untouched so the same samples are fetched again.
    pub fn poll(
        &mut self,
        client: &Em2Client,
        formulas: &FormulaRegistry,
    ) -> Result<usize, Em2Error> {
        self.last = None;

        let ready = client.ready_count()?;
        if ready <= self.index {
            return Ok(0);
        }
        let length = ready - self.index;

        let buffer = self
            .fetch_slice(client, formulas, length)
            .map_err(|e| match e {
                Em2Error::CommunicationLost(_) | Em2Error::Io { .. } => e,
                other => Em2Error::Readout {
                    context: format!(
                        "reading {length} sample(s) after sample {}",
                        self.index
                    ),
                    source: Box::new(other),
                },
            })?;

        let samples = buffer.samples();
        if self.is_continuous() {
            self.index += samples as u64;
        }
        debug!(
            "Read {samples} sample(s), {ready} ready, cursor at {}",
            self.index
        );
        self.last = Some(buffer);
        Ok(samples)
    }

    fn fetch_slice(
        &self,
        client: &Em2Client,
        formulas: &FormulaRegistry,
        length: u64,
    ) -> Result<ReadoutBuffer, Em2Error> {
        // not ready for timestamped data
        client.set_timestamp_data(false)?;

        // the instrument addresses sample n with offset n - 1
        let offset = self.index as i64 - 1;
        let data = client.read_measurement(offset, length)?;
        if data.is_empty() {
            return Err(Em2Error::Protocol("Measurement without channels".to_string()));
        }

        let mut channels = Vec::with_capacity(data.len());
        for (i, (name, values)) in data.iter().enumerate() {
            let channel = u8::try_from(i + 1).map_err(|_| {
                Em2Error::Protocol(format!("Too many channels in measurement ({})", data.len()))
            })?;
            let converted = formulas.convert(channel, values).map_err(|e| {
                debug!("Formula failed on {name}: {e}");
                e
            })?;
            channels.push(converted);
        }

        ReadoutBuffer::assemble(self.integration_time, channels)
    }

    /// Value of one axis from the last slice.
    ///
    /// Axis 1 is the time row; axis `n` is instrument channel `n - 1`. Software
    /// synchronised cycles return the first sample as a scalar, hardware cycles
    /// return the whole slice.
    pub fn fetch(&self, axis: u8) -> Reading {
        let Some(buffer) = &self.last else {
            return Reading::Empty;
        };
        let Some(row) = axis
            .checked_sub(1)
            .and_then(|index| buffer.row(index as usize))
        else {
            return Reading::Empty;
        };

        if self.sync_mode.is_software() {
            row.get(0).map_or(Reading::Empty, |&v| Reading::Scalar(v))
        } else {
            Reading::Series(row.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::em2::mock::{FakeEm2, MockInstrument};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn setup() -> (Em2Client, MockInstrument, Arc<Mutex<FakeEm2>>) {
        let (mock, fake) = MockInstrument::em2();
        let client = Em2Client::with_connector(mock.connector()).unwrap();
        (client, mock, fake)
    }

    #[test]
    fn test_cursor_advances_in_continuous_mode() {
        let (client, mock, fake) = setup();
        fake.lock().set_ready(&[3, 7, 10]);
        let formulas = FormulaRegistry::new();
        let mut cursor = ReadoutCursor::new();
        cursor.arm(0.1, 10, SyncMode::HardwareTrigger);

        let mut cursors = Vec::new();
        let mut lengths = Vec::new();
        for _ in 0..3 {
            lengths.push(cursor.poll(&client, &formulas).unwrap());
            cursors.push(cursor.index());
        }
        assert_eq!(cursors, vec![3, 7, 10]);
        assert_eq!(lengths, vec![3, 4, 3]);

        let fetches: Vec<String> = mock
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("ACQU:MEAS?"))
            .collect();
        assert_eq!(
            fetches,
            vec!["ACQU:MEAS? -1,3", "ACQU:MEAS? 2,4", "ACQU:MEAS? 6,3"]
        );
    }

    #[test]
    fn test_poll_selects_untimestamped_data() {
        let (client, mock, fake) = setup();
        fake.lock().set_ready(&[2]);
        let mut cursor = ReadoutCursor::new();
        cursor.arm(0.1, 5, SyncMode::HardwareTrigger);
        cursor.poll(&client, &FormulaRegistry::new()).unwrap();

        assert_eq!(
            mock.commands(),
            vec!["ACQU:NDAT?", "TMST 0", "ACQU:MEAS? -1,2"]
        );
    }

    #[test]
    fn test_answers_behind_error_segment() {
        let (client, _mock, fake) = setup();
        {
            let mut fake = fake.lock();
            fake.set_ready(&[2, 5]);
            fake.error_prefix = Some("ERR:OVERFLOW".to_string());
        }
        let formulas = FormulaRegistry::new();
        let mut cursor = ReadoutCursor::new();
        cursor.arm(0.1, 5, SyncMode::HardwareTrigger);

        assert_eq!(cursor.poll(&client, &formulas).unwrap(), 2);
        assert_eq!(cursor.poll(&client, &formulas).unwrap(), 3);
        assert_eq!(cursor.index(), 5);
        assert_eq!(cursor.fetch(2), Reading::Series(vec![102.0, 103.0, 104.0]));
    }

    #[test]
    fn test_no_new_samples() {
        let (client, mock, fake) = setup();
        fake.lock().set_ready(&[4, 4]);
        let formulas = FormulaRegistry::new();
        let mut cursor = ReadoutCursor::new();
        cursor.arm(0.1, 10, SyncMode::HardwareTrigger);

        assert_eq!(cursor.poll(&client, &formulas).unwrap(), 4);
        mock.clear_sent();
        assert_eq!(cursor.poll(&client, &formulas).unwrap(), 0);
        assert_eq!(cursor.index(), 4);
        assert_eq!(mock.commands(), vec!["ACQU:NDAT?"]);
        assert!(cursor.fetch(2).is_empty());
    }

    #[test]
    fn test_single_shot_does_not_advance() {
        let (client, mock, fake) = setup();
        fake.lock().set_ready(&[1]);
        let formulas = FormulaRegistry::new();
        let mut cursor = ReadoutCursor::new();
        cursor.arm(0.5, 1, SyncMode::SoftwareTrigger);

        for _ in 0..3 {
            assert_eq!(cursor.poll(&client, &formulas).unwrap(), 1);
            assert_eq!(cursor.index(), 0);
            assert_eq!(cursor.fetch(2), Reading::Scalar(100.0));
        }
        let fetches = mock
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("ACQU:MEAS?"))
            .collect::<Vec<_>>();
        assert_eq!(fetches, vec!["ACQU:MEAS? -1,1"; 3]);
    }

    #[test]
    fn test_formula_applied_per_channel() {
        let (client, _mock, fake) = setup();
        {
            let mut fake = fake.lock();
            fake.set_ready(&[1]);
            fake.channel_offsets = vec![5.0, 5.0, 5.0, 5.0];
        }
        let mut formulas = FormulaRegistry::new();
        formulas.set(1, "(value/10)*1e-06").unwrap();
        formulas.set(3, "VALUE * 2").unwrap();
        let mut cursor = ReadoutCursor::new();
        cursor.arm(0.1, 1, SyncMode::SoftwareTrigger);
        cursor.poll(&client, &formulas).unwrap();

        let converted = cursor.fetch(2).as_scalar().unwrap();
        assert!((converted - 5e-7).abs() < 1e-18);
        assert_eq!(cursor.fetch(3), Reading::Scalar(5.0));
        assert_eq!(cursor.fetch(4), Reading::Scalar(10.0));
    }

    #[test]
    fn test_fetch_shape_follows_sync_mode() {
        let formulas = FormulaRegistry::new();
        let mut results = Vec::new();
        for mode in [SyncMode::SoftwareTrigger, SyncMode::HardwareTrigger] {
            let (client, _mock, fake) = setup();
            fake.lock().set_ready(&[3]);
            let mut cursor = ReadoutCursor::new();
            cursor.arm(0.2, 3, mode);
            cursor.poll(&client, &formulas).unwrap();
            results.push((cursor.fetch(2), cursor.fetch(1)));
        }

        assert_eq!(results[0].0, Reading::Scalar(100.0));
        assert_eq!(results[0].1, Reading::Scalar(0.2));
        assert_eq!(results[1].0, Reading::Series(vec![100.0, 101.0, 102.0]));
        assert_eq!(results[1].1, Reading::Series(vec![0.2, 0.2, 0.2]));
    }

    #[test]
    fn test_fetch_before_poll_is_empty() {
        let cursor = ReadoutCursor::new();
        assert_eq!(cursor.fetch(2), Reading::Empty);
        assert_eq!(cursor.fetch(0), Reading::Empty);
    }

    #[test]
    fn test_conversion_failure_keeps_cursor() {
        let (client, _mock, fake) = setup();
        {
            let mut fake = fake.lock();
            fake.set_ready(&[2]);
            fake.channel_offsets = vec![0.0, 1.0, 1.0, 1.0];
        }
        let mut formulas = FormulaRegistry::new();
        formulas.set(1, "1 / value").unwrap();
        let mut cursor = ReadoutCursor::new();
        cursor.arm(0.1, 5, SyncMode::HardwareTrigger);

        let result = cursor.poll(&client, &formulas);
        assert!(matches!(result, Err(Em2Error::Readout { .. })));
        assert_eq!(cursor.index(), 0);
        assert!(cursor.buffer().is_none());

        formulas.reset(1);
        assert_eq!(cursor.poll(&client, &formulas).unwrap(), 2);
        assert_eq!(cursor.index(), 2);
    }

    #[test]
    fn test_arm_resets_cursor() {
        let (client, _mock, fake) = setup();
        fake.lock().set_ready(&[5]);
        let mut cursor = ReadoutCursor::new();
        cursor.arm(0.1, 5, SyncMode::HardwareGate);
        cursor.poll(&client, &FormulaRegistry::new()).unwrap();
        assert_eq!(cursor.index(), 5);

        cursor.arm(0.1, 5, SyncMode::HardwareGate);
        assert_eq!(cursor.index(), 0);
        assert!(cursor.buffer().is_none());
    }

    #[test]
    fn test_buffer_layout() {
        let buffer =
            ReadoutBuffer::assemble(0.5, vec![vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(buffer.samples(), 2);
        assert_eq!(buffer.channels(), 2);
        assert_eq!(buffer.time().to_vec(), vec![0.5, 0.5]);
        assert_eq!(
            buffer.to_rows(),
            vec![vec![0.5, 0.5], vec![1.0, 2.0], vec![3.0, 4.0]]
        );
        assert!(buffer.row(3).is_none());

        assert!(ReadoutBuffer::assemble(0.5, vec![vec![1.0], vec![1.0, 2.0]]).is_err());
    }
}
