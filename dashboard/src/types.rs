use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One telemetry observation reported by an incubator controller.
///
/// A `Sample` is never mutated after it reaches the store; a newer reading is
/// always a new `Sample`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Sample {
    #[serde(default)]
    pub device_id: String,
    #[serde(rename = "ts", with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub measurements: Measurements,
    #[serde(flatten)]
    pub actuators: ActuatorState,
    #[serde(flatten)]
    pub network: NetworkInfo,
}

impl Sample {
    pub fn new(device_id: &str, timestamp: DateTime<Utc>) -> Self {
        Sample {
            device_id: device_id.to_string(),
            timestamp,
            measurements: Measurements::default(),
            actuators: ActuatorState::default(),
            network: NetworkInfo::default(),
        }
    }

    pub fn with_measurements(mut self, temp_c: f64, hum_pct: f64) -> Self {
        self.measurements = Measurements {
            temp_c: Some(temp_c),
            hum_pct: Some(hum_pct),
        };
        self
    }

    pub fn with_actuators(mut self, actuators: ActuatorState) -> Self {
        self.actuators = actuators;
        self
    }

    pub fn with_network(mut self, ip: &str, uptime_s: u64) -> Self {
        self.network = NetworkInfo {
            ip: Some(ip.to_string()),
            uptime_s: Some(uptime_s),
        };
        self
    }

    /// Re-labels the sample with the routing device id of the envelope or
    /// request it arrived with.
    pub(crate) fn for_device(mut self, device_id: &str) -> Self {
        if self.device_id != device_id {
            self.device_id = device_id.to_string();
        }
        self
    }

    pub fn network_info(&self) -> Option<&NetworkInfo> {
        if self.network.ip.is_none() && self.network.uptime_s.is_none() {
            None
        } else {
            Some(&self.network)
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Measurements {
    #[serde(default)]
    pub temp_c: Option<f64>,
    #[serde(default)]
    pub hum_pct: Option<f64>,
}

/// Relay and switch flags as reported by the controller. A flag missing from
/// the payload reads as off.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActuatorState {
    #[serde(default)]
    pub primary_heater: bool,
    #[serde(default)]
    pub secondary_heater: bool,
    #[serde(default)]
    pub exhaust_fan: bool,
    #[serde(default)]
    pub fan: bool,
    #[serde(default)]
    pub sv_valve: bool,
    #[serde(default)]
    pub turning_motor: bool,
    #[serde(default)]
    pub door_light: bool,
    #[serde(default)]
    pub limit_switch: bool,
}

impl ActuatorState {
    pub fn flags(&self) -> [(&'static str, bool); 8] {
        [
            ("primary_heater", self.primary_heater),
            ("secondary_heater", self.secondary_heater),
            ("exhaust_fan", self.exhaust_fan),
            ("fan", self.fan),
            ("sv_valve", self.sv_valve),
            ("turning_motor", self.turning_motor),
            ("door_light", self.door_light),
            ("limit_switch", self.limit_switch),
        ]
    }

    pub fn is_on(&self, name: &str) -> Option<bool> {
        self.flags()
            .iter()
            .find(|(flag, _)| *flag == name)
            .map(|(_, on)| *on)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct NetworkInfo {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub uptime_s: Option<u64>,
}

// Server-side 24h aggregates for one device
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceStats {
    #[serde(default)]
    pub max_temp_c: Option<f64>,
    #[serde(default)]
    pub avg_temp_c: Option<f64>,
    #[serde(default)]
    pub max_hum_pct: Option<f64>,
    #[serde(default)]
    pub avg_hum_pct: Option<f64>,
}

/// The backend emits RFC 3339 timestamps, but older records carry naive
/// datetimes with no offset. Those are read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}
