use serde::{Deserialize, Serialize};

use crate::params::{
    DIMMER_NODE_ID, HEATER_NODE_ID, PARAM_DIMMER_DUTY_CYCLE, PARAM_DIMMER_PERIOD,
    PARAM_HEATER_OFF_TIME, PARAM_HEATER_ON_TIME,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DimmerConfig {
    pub node_id: u32,
    pub duty_cycle_param: String,
    pub period_param: String,
    /// Write the best PWM period after every duty cycle change.
    pub auto_period: bool,
}

impl Default for DimmerConfig {
    fn default() -> Self {
        Self {
            node_id: DIMMER_NODE_ID,
            duty_cycle_param: PARAM_DIMMER_DUTY_CYCLE.to_string(),
            period_param: PARAM_DIMMER_PERIOD.to_string(),
            auto_period: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaterTimerConfig {
    pub node_id: u32,
    pub on_time_param: String,
    pub off_time_param: String,
}

impl Default for HeaterTimerConfig {
    fn default() -> Self {
        Self {
            node_id: HEATER_NODE_ID,
            on_time_param: PARAM_HEATER_ON_TIME.to_string(),
            off_time_param: PARAM_HEATER_OFF_TIME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub backend_url: String,
    pub http_port: u16,
    pub web_root: Option<String>,
    /// IANA zone used for device times. `None` means the machine's local zone.
    pub timezone: Option<String>,
    pub dimmer: DimmerConfig,
    pub heater: HeaterTimerConfig,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://kanthaus-server".to_string(),
            http_port: 8080,
            web_root: None,
            timezone: None,
            dimmer: DimmerConfig::default(),
            heater: HeaterTimerConfig::default(),
        }
    }
}

impl DashboardConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.backend_url.trim().trim_end_matches('/');
        self.backend_url = if trimmed.is_empty() {
            Self::default().backend_url
        } else {
            trimmed.to_string()
        };

        if self.http_port == 0 {
            self.http_port = 8080;
        }

        if self
            .timezone
            .as_deref()
            .is_some_and(|zone| zone.trim().is_empty())
        {
            self.timezone = None;
        }
    }
}
