use crate::config::AppConfig;
use crate::em2::{Em2Client, Protocol};
use crate::error::Em2Error;
use crate::formula::FormulaRegistry;
use crate::readout::{ReadoutBuffer, ReadoutCursor};
use crate::session::AcquisitionSession;
use crate::types::{
    AxisParameter, AxisRole, ParameterValue, Reading, StatusReport, SyncMode, TriggerInput,
    MASTER_AXIS,
};
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Counter/timer controller for one EM2 electrometer.
///
/// Axis 1 is the master (timing) channel; axes 2..=5 map to instrument
/// channels 1..=4. The host calls the lifecycle methods in the order
/// `load_one` → `pre_start_one` → `start_all` → (`state_all` / `read_all` /
/// `read_one`)* and may call `abort_one` at any time.
///
/// # Examples
///
/// ```no_run
/// use rusty_em::{Em2Client, Em2Controller, SyncMode};
/// use std::sync::Arc;
///
/// let client = Arc::new(Em2Client::new("electproto19", 5025)?);
/// let mut ctrl = Em2Controller::new(client, None);
/// for axis in 1..=5 {
///     ctrl.add_device(axis)?;
/// }
/// ctrl.set_synchronization(SyncMode::SoftwareTrigger);
/// ctrl.load_one(1, 1.1, 10)?;
/// ctrl.start_all()?;
/// ctrl.read_all()?;
/// println!("{:?}", ctrl.read_one(2)?);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Em2Controller {
    session: AcquisitionSession,
    cursor: ReadoutCursor,
    formulas: FormulaRegistry,
    axes: BTreeMap<u8, AxisRole>,
    ext_trigger_input: Option<TriggerInput>,
    synchronization: SyncMode,
    state: StatusReport,
}

impl Em2Controller {
    pub fn new(client: Arc<Em2Client>, ext_trigger_input: Option<TriggerInput>) -> Self {
        Self {
            session: AcquisitionSession::new(client),
            cursor: ReadoutCursor::new(),
            formulas: FormulaRegistry::new(),
            axes: BTreeMap::new(),
            ext_trigger_input,
            synchronization: SyncMode::default(),
            state: StatusReport::default(),
        }
    }

    /// Connect to the configured instrument and register its axes and formulas.
    pub fn from_config(config: &AppConfig) -> Result<Self, Em2Error> {
        config.validate()?;
        let instrument = &config.instrument;
        let client = Em2Client::builder()
            .address(&instrument.host)
            .port(instrument.port)
            .config(instrument.connection_config())
            .build()?;
        info!("Connected to EM2 at {}", client.endpoint());

        let mut controller = Self::new(Arc::new(client), instrument.trigger_input()?)
            .with_start_timeout(instrument.start_timeout());
        for axis in config.acquisition.axes() {
            controller.add_device(axis)?;
        }
        for (axis, formula) in config.axis_formulas()? {
            controller.set_axis_par(axis, "formula", formula.into())?;
        }
        controller.set_synchronization(config.acquisition.sync_mode);
        if let Some(mode) = &config.acquisition.acquisition_mode {
            controller.set_ctrl_par("AcquisitionMode", mode.as_str().into())?;
        }
        Ok(controller)
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.session = self.session.with_start_timeout(timeout);
        self
    }

    pub fn client(&self) -> &Arc<Em2Client> {
        self.session.client()
    }

    pub fn session(&self) -> &AcquisitionSession {
        &self.session
    }

    pub fn cursor(&self) -> &ReadoutCursor {
        &self.cursor
    }

    pub fn formulas(&self) -> &FormulaRegistry {
        &self.formulas
    }

    pub fn axes(&self) -> impl Iterator<Item = u8> + '_ {
        self.axes.keys().copied()
    }

    pub fn synchronization(&self) -> SyncMode {
        self.synchronization
    }

    /// Slice fetched by the last `read_all`.
    pub fn buffer(&self) -> Option<&ReadoutBuffer> {
        self.cursor.buffer()
    }

    pub fn add_device(&mut self, axis: u8) -> Result<(), Em2Error> {
        let role = AxisRole::of(axis)?;
        debug!("AddDevice({axis}): {role:?}");
        if let AxisRole::Measurement { .. } = role {
            self.cursor.reset();
        }
        self.axes.insert(axis, role);
        Ok(())
    }

    pub fn delete_device(&mut self, axis: u8) -> Result<(), Em2Error> {
        debug!("DeleteDevice({axis})");
        match self.axes.remove(&axis) {
            Some(AxisRole::Measurement { channel }) => {
                self.formulas.reset(channel);
                Ok(())
            }
            Some(AxisRole::Master) => Ok(()),
            None => Err(Em2Error::Usage(format!("Axis {axis} is not registered"))),
        }
    }

    /// Synchronization used by the next `load_one`.
    pub fn set_synchronization(&mut self, mode: SyncMode) {
        self.synchronization = mode;
    }

    /// Configure the acquisition through the master channel.
    ///
    /// # Errors
    /// `Em2Error::Usage` for any axis other than the master.
    pub fn load_one(
        &mut self,
        axis: u8,
        integration_time: f64,
        repetitions: u64,
    ) -> Result<(), Em2Error> {
        if self.role(axis)? != AxisRole::Master {
            return Err(Em2Error::Usage(format!(
                "The master channel should be the axis {MASTER_AXIS}, got {axis}"
            )));
        }
        self.session.configure(
            integration_time,
            repetitions,
            self.synchronization,
            self.ext_trigger_input,
        )?;
        self.cursor.arm(
            integration_time,
            self.session.repetitions(),
            self.synchronization,
        );
        Ok(())
    }

    /// Check the connection before a start.
    ///
    /// Returns `false` when the instrument gave no answer.
    pub fn pre_start_one(&mut self, axis: u8) -> Result<bool, Em2Error> {
        if let AxisRole::Measurement { .. } = self.role(axis)? {
            self.cursor.reset();
        }
        self.session.prepare()
    }

    pub fn start_all(&mut self) -> Result<(), Em2Error> {
        let result = self.session.start();
        self.state = self.session.last_status().clone();
        result
    }

    pub fn state_all(&mut self) -> Result<(), Em2Error> {
        self.state = self.session.status()?;
        Ok(())
    }

    /// Cached report of the last `state_all`, shared by every axis.
    pub fn state_one(&self, axis: u8) -> Result<StatusReport, Em2Error> {
        self.role(axis)?;
        Ok(self.state.clone())
    }

    /// Fetch and convert new samples; returns how many arrived.
    pub fn read_all(&mut self) -> Result<usize, Em2Error> {
        self.cursor.poll(self.session.client(), &self.formulas)
    }

    pub fn read_one(&self, axis: u8) -> Result<Reading, Em2Error> {
        self.role(axis)?;
        Ok(self.cursor.fetch(axis))
    }

    pub fn abort_one(&mut self, axis: u8) -> Result<(), Em2Error> {
        debug!("AbortOne({axis})");
        self.session.stop()
    }

    pub fn get_axis_par(&self, axis: u8, name: &str) -> Result<ParameterValue, Em2Error> {
        let channel = self.measurement_channel(axis)?;
        let client = self.session.client();
        Ok(match name.parse::<AxisParameter>()? {
            AxisParameter::Range => ParameterValue::Text(client.range(channel)?),
            AxisParameter::Inversion => ParameterValue::Flag(client.inversion(channel)?),
            AxisParameter::InstantCurrent => {
                ParameterValue::Number(client.instant_current(channel)?)
            }
            AxisParameter::Formula => {
                ParameterValue::Text(self.formulas.get(channel).source().to_string())
            }
        })
    }

    pub fn set_axis_par(
        &mut self,
        axis: u8,
        name: &str,
        value: ParameterValue,
    ) -> Result<(), Em2Error> {
        let channel = self.measurement_channel(axis)?;
        match name.parse::<AxisParameter>()? {
            AxisParameter::Range => self.session.client().set_range(channel, &value.to_string()),
            AxisParameter::Inversion => {
                let inverted = match value {
                    ParameterValue::Flag(flag) => flag,
                    ParameterValue::Number(n) => n != 0.0,
                    ParameterValue::Text(text) => {
                        Protocol::parse_on_off("Inversion", &text)?
                    }
                };
                self.session.client().set_inversion(channel, inverted)
            }
            AxisParameter::InstantCurrent => Err(Em2Error::Usage(
                "InstantCurrent is read-only".to_string(),
            )),
            AxisParameter::Formula => {
                let text = value.as_text().ok_or_else(|| {
                    Em2Error::Usage(format!("Formula must be text, got {value}"))
                })?;
                self.formulas.set(channel, text)?;
                Ok(())
            }
        }
    }

    pub fn get_ctrl_par(&self, name: &str) -> Result<ParameterValue, Em2Error> {
        match name.to_lowercase().as_str() {
            "acquisitionmode" => Ok(ParameterValue::Text(
                self.session.client().acquisition_mode()?,
            )),
            _ => Err(Em2Error::Usage(format!("Unknown controller parameter '{name}'"))),
        }
    }

    pub fn set_ctrl_par(&mut self, name: &str, value: ParameterValue) -> Result<(), Em2Error> {
        match name.to_lowercase().as_str() {
            "acquisitionmode" => self
                .session
                .client()
                .set_acquisition_mode(&value.to_string()),
            _ => Err(Em2Error::Usage(format!("Unknown controller parameter '{name}'"))),
        }
    }

    fn role(&self, axis: u8) -> Result<AxisRole, Em2Error> {
        let role = AxisRole::of(axis)?;
        if self.axes.contains_key(&axis) {
            Ok(role)
        } else {
            Err(Em2Error::Usage(format!("Axis {axis} is not registered")))
        }
    }

    fn measurement_channel(&self, axis: u8) -> Result<u8, Em2Error> {
        match self.role(axis)? {
            AxisRole::Measurement { channel } => Ok(channel),
            AxisRole::Master => Err(Em2Error::Usage(format!(
                "The axis {MASTER_AXIS} does not use the extra attributes"
            ))),
        }
    }
}
