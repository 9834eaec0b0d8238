use super::Em2Client;
use crate::em2::protocol::Protocol;
use crate::error::Em2Error;

impl Em2Client {
    /// Read the amplifier range of an instrument channel (`CHANnn:CABO:RANGE?`).
    ///
    /// # Arguments
    /// * `channel` - Instrument channel, 1-based
    ///
    /// # Returns
    /// The range token as reported, e.g. `"1mA"` or `"100pA"`.
    pub fn range(&self, channel: u8) -> Result<String, Em2Error> {
        self.query(&format!("CHAN{channel:02}:CABO:RANGE?"))
    }

    pub fn set_range(&self, channel: u8, range: &str) -> Result<(), Em2Error> {
        self.command(&format!("CHAN{channel:02}:CABO:RANGE {range}"))
    }

    /// Read the digital inversion flag of an instrument channel.
    pub fn inversion(&self, channel: u8) -> Result<bool, Em2Error> {
        let command = format!("CHAN{channel:02}:CABO:INVE?");
        let answer = self.query(&command)?;
        Protocol::parse_on_off(&command, &answer)
    }

    pub fn set_inversion(&self, channel: u8, inverted: bool) -> Result<(), Em2Error> {
        self.command(&format!(
            "CHAN{channel:02}:CABO:INVE {}",
            Protocol::on_off(inverted)
        ))
    }

    /// Instantaneous current of an instrument channel, in amperes.
    ///
    /// This is the raw value; channel formulas are not applied.
    pub fn instant_current(&self, channel: u8) -> Result<f64, Em2Error> {
        let command = format!("CHAN{channel:02}:INSCurrent?");
        let answer = self.query(&command)?;
        Protocol::parse_f64(&command, &answer)
    }
}
