use super::Em2Client;
use crate::error::Em2Error;
use crate::types::{SyncMode, TriggerInput};

impl Em2Client {
    /// Select the trigger source matching a synchronization mode (`TRIG:MODE`).
    ///
    /// Software modes map to `SOFTWARE`, hardware trigger to `HARDWARE` and
    /// hardware gate to `GATE`.
    pub fn set_trigger_mode(&self, mode: SyncMode) -> Result<(), Em2Error> {
        self.command(&format!("TRIG:MODE {}", mode.trigger_source()))
    }

    /// Read back the trigger source token (`TRIG:MODE?`).
    pub fn trigger_mode(&self) -> Result<String, Em2Error> {
        self.query("TRIG:MODE?")
    }

    /// Route an external line to the trigger logic (`TRIG:INPU`).
    pub fn set_trigger_input(&self, input: TriggerInput) -> Result<(), Em2Error> {
        self.command(&format!("TRIG:INPU {input}"))
    }
}
