//! Controller configuration

use crate::logging::LogSettings;
use crate::ports::PortPolicy;
use crate::transport::snowflake::SnowflakeSettings;
use std::path::PathBuf;

/// ControllerConfig is everything a [`Controller`](crate::Controller) is
/// created with
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Where transports keep their state and the log file lives. Should be
    /// app-private and not temporary.
    pub state_dir: PathBuf,
    pub ports: PortPolicy,
    /// Install a log subscriber when set
    pub log: Option<LogSettings>,
    pub snowflake: SnowflakeSettings,
}

impl ControllerConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ports: PortPolicy::Ephemeral,
            log: None,
            snowflake: SnowflakeSettings::default(),
        }
    }

    pub fn with_ports(mut self, ports: PortPolicy) -> Self {
        self.ports = ports;
        self
    }

    /// with_fixed_ports switches to the stable default port layout
    pub fn with_fixed_ports(self) -> Self {
        self.with_ports(PortPolicy::fixed())
    }

    pub fn with_logging(mut self, log: LogSettings) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_snowflake(mut self, snowflake: SnowflakeSettings) -> Self {
        self.snowflake = snowflake;
        self
    }
}
