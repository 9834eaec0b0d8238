//! Acquisition state machine of the electrometer.
//!
//! The instrument only reports free-text status strings; the session turns them
//! into [`AcquisitionState`] values and tracks where in the
//! configure → start → acquire → stop cycle it is.

use crate::em2::Em2Client;
use crate::error::Em2Error;
use crate::types::{AcquisitionState, StatusReport, SyncMode, TriggerInput};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shortest integration time the hardware accepts, in milliseconds.
pub const MIN_INTEGRATION_TIME_MS: f64 = 0.1;

/// How long `start()` waits for the instrument to report an acquisition.
pub const START_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Configured,
    Armed,
    Fault,
}

/// Integration time converted to the instrument's unit, clamped to its floor.
pub fn integration_time_ms(seconds: f64) -> f64 {
    let milliseconds = seconds * 1000.0;
    if milliseconds < MIN_INTEGRATION_TIME_MS {
        debug!("The minimum integration time is {MIN_INTEGRATION_TIME_MS} ms");
        MIN_INTEGRATION_TIME_MS
    } else {
        milliseconds
    }
}

pub struct AcquisitionSession {
    client: Arc<Em2Client>,
    sync_mode: SyncMode,
    integration_time: f64,
    repetitions: u64,
    trigger_input: Option<TriggerInput>,
    phase: SessionPhase,
    last_status: StatusReport,
    start_timeout: Duration,
}

impl AcquisitionSession {
    pub fn new(client: Arc<Em2Client>) -> Self {
        Self {
            client,
            sync_mode: SyncMode::default(),
            integration_time: 0.0,
            repetitions: 0,
            trigger_input: None,
            phase: SessionPhase::Idle,
            last_status: StatusReport::default(),
            start_timeout: START_TIMEOUT,
        }
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Arc<Em2Client> {
        &self.client
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Integration time of one sample in seconds, as requested.
    pub fn integration_time(&self) -> f64 {
        self.integration_time
    }

    /// Number of triggers armed on the instrument.
    pub fn repetitions(&self) -> u64 {
        self.repetitions
    }

    pub fn trigger_input(&self) -> Option<TriggerInput> {
        self.trigger_input
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn last_status(&self) -> &StatusReport {
        &self.last_status
    }

    /// Program integration time, trigger source and trigger count.
    ///
    /// Software modes always arm a single trigger; hardware modes arm
    /// `repetitions` triggers and route `trigger_input` to the trigger logic.
    ///
    /// # Errors
    /// - `Em2Error::Usage` for a negative or non-finite integration time, or a
    ///   hardware mode without trigger input. Nothing is sent in that case.
    /// - Communication errors from the command channel.
    pub fn configure(
        &mut self,
        integration_time: f64,
        repetitions: u64,
        sync_mode: SyncMode,
        trigger_input: Option<TriggerInput>,
    ) -> Result<(), Em2Error> {
        if !integration_time.is_finite() || integration_time < 0.0 {
            return Err(Em2Error::Usage(format!(
                "Invalid integration time {integration_time} s"
            )));
        }
        if sync_mode.needs_trigger_input() && trigger_input.is_none() {
            return Err(Em2Error::Usage(format!(
                "Synchronization {sync_mode} needs an external trigger input"
            )));
        }

        self.phase = SessionPhase::Idle;
        self.integration_time = integration_time;
        self.sync_mode = sync_mode;
        self.trigger_input = trigger_input;

        self.client
            .set_acquisition_time_ms(integration_time_ms(integration_time))?;

        self.repetitions = sync_mode.armed_repetitions(repetitions);
        self.client.set_trigger_mode(sync_mode)?;
        if let (true, Some(input)) = (sync_mode.needs_trigger_input(), trigger_input) {
            self.client.set_trigger_input(input)?;
        }
        self.client.set_trigger_count(self.repetitions)?;

        info!(
            "Configured {sync_mode}: {integration_time} s x {} trigger(s)",
            self.repetitions
        );
        self.phase = SessionPhase::Configured;
        Ok(())
    }

    /// Check that the instrument answers before starting.
    ///
    /// # Returns
    /// `false` if the status query got no answer; the caller must not start.
    pub fn prepare(&self) -> Result<bool, Em2Error> {
        match self.client.probe_status()? {
            Some(status) => {
                debug!("Pre-start status: {status}");
                Ok(true)
            }
            None => {
                warn!("Electrometer did not answer the pre-start status query");
                Ok(false)
            }
        }
    }

    /// Start the acquisition and wait until the instrument reports it.
    ///
    /// The status is polled back to back until it maps to `Moving`. Very short
    /// acquisitions may already be over at the first poll and then look like a
    /// failed start.
    ///
    /// # Errors
    /// `Em2Error::StartTimeout` if no `Moving` state is seen within the start
    /// timeout (3 s by default).
    pub fn start(&mut self) -> Result<(), Em2Error> {
        self.client.start_acquisition(self.sync_mode.is_software())?;

        let started = Instant::now();
        loop {
            let report = self.status()?;
            if report.is_moving() {
                debug!("Acquisition running after {:?}", started.elapsed());
                return Ok(());
            }
            if started.elapsed() > self.start_timeout {
                self.phase = SessionPhase::Fault;
                warn!(
                    "Hardware did not start the acquisition within {:?} (status {})",
                    self.start_timeout, report.status
                );
                return Err(Em2Error::StartTimeout {
                    status: report.status,
                });
            }
        }
    }

    /// Query and remember the instrument status.
    pub fn status(&mut self) -> Result<StatusReport, Em2Error> {
        let report = self.client.acquisition_status()?;
        self.phase = match (report.state, self.phase) {
            (AcquisitionState::Moving, _) => SessionPhase::Armed,
            (AcquisitionState::Fault, _) => SessionPhase::Fault,
            (AcquisitionState::On, SessionPhase::Armed) => SessionPhase::Configured,
            (AcquisitionState::On, phase) => phase,
        };
        self.last_status = report.clone();
        Ok(report)
    }

    /// Stop any running acquisition.
    pub fn stop(&mut self) -> Result<(), Em2Error> {
        self.client.stop_acquisition()?;
        if self.phase == SessionPhase::Armed {
            self.phase = SessionPhase::Configured;
        }
        Ok(())
    }
}
