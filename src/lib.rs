pub mod config;
pub mod controller;
pub mod em2;
pub mod error;
pub mod formula;
pub mod logger;
pub mod plotting;
pub mod readout;
pub mod session;
pub mod types;

pub use controller::Em2Controller;
pub use em2::{ConnectionConfig, Connector, Em2Client, Em2ClientBuilder, TcpConnector, Transport};
pub use error::Em2Error;
pub use formula::{Formula, FormulaError, FormulaRegistry};
pub use logger::{Logger, ReadoutRecord};
pub use plotting::{plot_channel, plot_series};
pub use readout::{ReadoutBuffer, ReadoutCursor};
pub use session::{AcquisitionSession, SessionPhase};
pub use types::{
    AcquisitionState, AxisParameter, AxisRole, ParameterValue, Reading, StatusReport, SyncMode,
    TriggerInput, MASTER_AXIS, MAX_AXES,
};
