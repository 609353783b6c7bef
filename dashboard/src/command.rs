use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{is_auth_status, CommandSendError};
use crate::session::Session;

#[derive(Serialize, Debug)]
struct CommandRequest<'a> {
    cmd: &'a str,
    params: &'a Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MotorDirection {
    Left,
    Right,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum MotorMode {
    /// Motor toggles every `timer_sec` seconds.
    #[default]
    Timer,
    AlwaysOn,
}

impl From<MotorMode> for u8 {
    fn from(mode: MotorMode) -> u8 {
        match mode {
            MotorMode::Timer => 0,
            MotorMode::AlwaysOn => 1,
        }
    }
}

impl TryFrom<u8> for MotorMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MotorMode::Timer),
            1 => Ok(MotorMode::AlwaysOn),
            other => Err(format!("unknown motor mode {other}")),
        }
    }
}

/// Controller settings pushed with `SET_CONFIG`. Thresholds are in the
/// controller's configured temperature unit.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DeviceSettings {
    pub temp_low: Option<f64>,
    pub temp_high: Option<f64>,
    pub humidity_temp: Option<f64>,
    pub sensor1_offset: Option<f64>,
    pub sensor2_offset: Option<f64>,
    pub motor_mode: MotorMode,
    pub timer_sec: Option<u32>,
}

/// The commands the controller firmware understands.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    PrimaryHeater(bool),
    SecondaryHeater(bool),
    DoorLight(bool),
    SvValve(bool),
    TurnMotor(MotorDirection),
    Reboot,
    OtaCheck,
    SetConfig(DeviceSettings),
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::PrimaryHeater(_) => "PRIMARY_HEATER",
            DeviceCommand::SecondaryHeater(_) => "SECONDARY_HEATER",
            DeviceCommand::DoorLight(_) => "DOOR_LIGHT",
            DeviceCommand::SvValve(_) => "SV_VALVE",
            DeviceCommand::TurnMotor(_) => "TURN_MOTOR",
            DeviceCommand::Reboot => "REBOOT",
            DeviceCommand::OtaCheck => "OTA_CHECK",
            DeviceCommand::SetConfig(_) => "SET_CONFIG",
        }
    }

    pub fn params(&self) -> Value {
        match self {
            DeviceCommand::PrimaryHeater(state)
            | DeviceCommand::SecondaryHeater(state)
            | DeviceCommand::DoorLight(state)
            | DeviceCommand::SvValve(state) => json!({ "state": state }),
            DeviceCommand::TurnMotor(dir) => json!({ "dir": dir }),
            DeviceCommand::Reboot | DeviceCommand::OtaCheck => json!({}),
            DeviceCommand::SetConfig(settings) => json!({
                "temp_low": settings.temp_low,
                "temp_high": settings.temp_high,
                "humidity_temp": settings.humidity_temp,
                "sensor1_offset": settings.sensor1_offset,
                "sensor2_offset": settings.sensor2_offset,
                "motor_mode": u8::from(settings.motor_mode),
                "timer_sec": settings.timer_sec,
            }),
        }
    }
}

/// Relays control messages to devices through the backend.
///
/// One attempt per call and no retry. `Ok` means the backend accepted the
/// command for transmission, not that the device applied it; the applied
/// state shows up later in telemetry.
#[derive(Clone)]
pub struct CommandDispatcher {
    client: Client,
    api_url: String,
    session: Session,
}

impl CommandDispatcher {
    pub fn new(client: Client, api_url: &str, session: Session) -> Self {
        CommandDispatcher {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    pub async fn send(&self, device_id: &str, command_name: &str, params: &Value) -> Result<(), CommandSendError> {
        let url = format!("{}/devices/{}/cmd", self.api_url, device_id);
        let body = CommandRequest {
            cmd: command_name,
            params,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.session.token())
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if is_auth_status(status) {
            return Err(CommandSendError::Unauthorized {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(CommandSendError::Rejected {
                cmd: command_name.to_string(),
                status: status.as_u16(),
            });
        }

        log::info!("Command {} sent to device {}.", command_name, device_id);
        Ok(())
    }

    pub async fn send_command(&self, device_id: &str, command: &DeviceCommand) -> Result<(), CommandSendError> {
        self.send(device_id, command.name(), &command.params()).await
    }
}
