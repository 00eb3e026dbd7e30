pub mod config;
pub mod device_time;
pub mod dimmer;
pub mod params;
pub mod types;

pub use config::{DashboardConfig, DimmerConfig, HeaterTimerConfig};
pub use device_time::{OffsetSource, TimeCodec, TimeCodecError};
pub use dimmer::{best_period, effective_duty_cycle, ranked_periods, PeriodOption};
pub use params::*;
pub use types::{Node, NodeDetail, NodeList, ParamValue, ParamWrite, Parameter};
