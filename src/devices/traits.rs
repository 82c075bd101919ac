use chrono::{DateTime, Utc};
use serde_json::Value;

/// A timestamped set of values read from one device.
pub trait DeviceData: Send + Sync {
    fn device_address(&self) -> u8;
    fn timestamp(&self) -> DateTime<Utc>;

    fn unix_timestamp(&self) -> i64 {
        self.timestamp().timestamp()
    }

    fn to_json(&self) -> Value;
    fn get_parameter(&self, name: &str) -> Option<String>;

    /// Every parameter as a display string; values the device did not
    /// answer for are omitted.
    fn get_all_parameters(&self) -> Vec<(String, String)>;
}
