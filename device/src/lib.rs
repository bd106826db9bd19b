pub mod broker;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod flush;
pub mod logging;
pub mod net;
pub mod scheduler;
pub mod sensor;
pub mod simulate;
pub mod storage;
pub mod testing;
pub mod types;

pub use config::{AgentSettings, ConfigureRequest, TrackerConfig};
pub use controller::{AgentController, ControllerOptions};
pub use types::{AgentEvent, Command, EventSink};
