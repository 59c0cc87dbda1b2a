pub mod actuator;
pub mod http;
pub mod mock;
pub mod monitor;
pub mod state;

pub use actuator::{Actuator, ActuatorError, ActuatorResult, AuxReport, Health, PoseReport, RemoteConfig};
pub use http::HttpActuator;
pub use mock::{ActuatorCall, MockActuator, RecordedCall};
pub use monitor::{ConnectivityMonitor, MonitorStats};
pub use state::{ActuatorState, SharedActuatorState};
