pub const PARAM_DIMMER_DUTY_CYCLE: &str = "CONFIG_DIMMER_DUTY_CYCLE";
pub const PARAM_DIMMER_PERIOD: &str = "CONFIG_DIMMER_PERIOD";

pub const PARAM_HEATER_ON_TIME: &str = "CONFIG_HEATER_ON_TIME";
pub const PARAM_HEATER_OFF_TIME: &str = "CONFIG_HEATER_OFF_TIME";

pub const DIMMER_NODE_ID: u32 = 10;
pub const HEATER_NODE_ID: u32 = 11;
