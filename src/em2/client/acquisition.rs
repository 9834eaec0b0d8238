use super::Em2Client;
use crate::em2::protocol::Protocol;
use crate::error::Em2Error;
use crate::types::StatusReport;

impl Em2Client {
    /// Query the acquisition state (`ACQU:STAT?`).
    ///
    /// # Returns
    /// The raw status text together with the state derived from it. Text the
    /// controller does not know is reported as `Fault`.
    ///
    /// # Errors
    /// Returns `Em2Error` if communication fails or the instrument closes the
    /// connection without answering.
    pub fn acquisition_status(&self) -> Result<StatusReport, Em2Error> {
        let command = "ACQU:STAT?";
        // error answers are status text too and map to Fault
        let status = self
            .exchange(command, true)?
            .ok_or_else(|| Em2Error::NoResponse(command.to_string()))?;
        Ok(StatusReport::from_status(status))
    }

    /// Status query that tolerates a missing answer.
    ///
    /// Used as a connectivity probe: `Ok(None)` means the instrument did not
    /// answer at all. Any answer counts, including an `ERROR` one.
    pub fn probe_status(&self) -> Result<Option<String>, Em2Error> {
        self.exchange("ACQU:STAT?", true)
    }

    /// Set the integration time of one sample, in milliseconds (`ACQU:TIME`).
    pub fn set_acquisition_time_ms(&self, milliseconds: f64) -> Result<(), Em2Error> {
        self.command(&format!("ACQU:TIME {milliseconds:?}"))
    }

    /// Set how many triggers the next acquisition accepts (`ACQU:NTRI`).
    pub fn set_trigger_count(&self, count: u64) -> Result<(), Em2Error> {
        self.command(&format!("ACQU:NTRI {count}"))
    }

    /// Arm the acquisition (`ACQU:START`).
    ///
    /// # Arguments
    /// * `software_trigger` - Append `SWTRIG` so the instrument triggers itself
    ///   right away instead of waiting for an external edge.
    pub fn start_acquisition(&self, software_trigger: bool) -> Result<(), Em2Error> {
        if software_trigger {
            self.command("ACQU:START SWTRIG")
        } else {
            self.command("ACQU:START")
        }
    }

    /// Stop the acquisition (`ACQU:STOP`). Safe to call in any state.
    pub fn stop_acquisition(&self) -> Result<(), Em2Error> {
        self.command("ACQU:STOP")
    }

    /// Number of samples stored in the instrument buffer (`ACQU:NDAT?`).
    pub fn ready_count(&self) -> Result<u64, Em2Error> {
        let command = "ACQU:NDAT?";
        let answer = self.query(command)?;
        Protocol::parse_u64(command, &answer)
    }

    /// Select whether buffered data carries timestamps (`TMST`).
    pub fn set_timestamp_data(&self, enabled: bool) -> Result<(), Em2Error> {
        self.command(if enabled { "TMST 1" } else { "TMST 0" })
    }

    /// Read buffered samples of every channel (`ACQU:MEAS? <offset>,<count>`).
    ///
    /// The offset is passed through untouched; callers address sample `n` with
    /// offset `n - 1`.
    ///
    /// # Returns
    /// `(channel name, values)` pairs in channel order.
    ///
    /// # Examples
    /// ```no_run
    /// use rusty_em::Em2Client;
    ///
    /// let client = Em2Client::new("electproto19", 5025)?;
    /// let ready = client.ready_count()?;
    /// for (name, values) in client.read_measurement(-1, ready)? {
    ///     println!("{name}: {values:?}");
    /// }
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn read_measurement(
        &self,
        offset: i64,
        count: u64,
    ) -> Result<Vec<(String, Vec<f64>)>, Em2Error> {
        let answer = self.query(&format!("ACQU:MEAS? {offset},{count}"))?;
        Protocol::parse_measurement(&answer)
    }

    /// Read the acquisition mode (`ACQU:MODE?`), e.g. `CURRENT` or `CHARGE`.
    pub fn acquisition_mode(&self) -> Result<String, Em2Error> {
        self.query("ACQU:MODE?")
    }

    pub fn set_acquisition_mode(&self, mode: &str) -> Result<(), Em2Error> {
        self.command(&format!("ACQU:MODE {mode}"))
    }
}
