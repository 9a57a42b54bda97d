use std::{env, fs};

use dtu2mqtt::home_assistant::HassMqttConfig;
use dtu2mqtt::mqtt_config::MqttConfig;
use dtu2mqtt::production::{ActivityCheck, ResetHeuristic, DEFAULT_RESET_HOUR};
use log::warn;
use serde::Deserialize;

const DEFAULT_DTU_PORT: u16 = 502;
const DEFAULT_MODBUS_UNIT_ID: u8 = 1;
const DEFAULT_QUERY_PERIOD_SEC: u64 = 60;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Raise the default log level to debug. $RUST_LOG takes precedence.
    pub debug: Option<bool>,
    pub dtu_host: String,
    pub dtu_port: Option<u16>,
    pub modbus_unit_id: Option<u8>,
    /// How often (in seconds) the DTU shall be queried.
    pub query_period: Option<u64>,
    /// Hour of day in which the DTU resets the daily production counters.
    pub reset_hour: Option<u32>,
    pub activity_check: Option<ActivityCheck>,
    pub reset_heuristic: Option<ResetHeuristic>,
    #[serde(default)]
    pub home_assistant: HassMqttConfig,
    pub mqtt: MqttConfig,
}

impl Config {
    pub fn is_valid(&self) -> bool {
        !self.dtu_host.is_empty() && self.mqtt.is_valid() && self.reset_hour.unwrap_or(0) < 24
    }

    pub fn debug(&self) -> bool {
        self.debug.unwrap_or(false)
    }

    pub fn dtu_port(&self) -> u16 {
        self.dtu_port.unwrap_or(DEFAULT_DTU_PORT)
    }

    pub fn modbus_unit_id(&self) -> u8 {
        self.modbus_unit_id.unwrap_or(DEFAULT_MODBUS_UNIT_ID)
    }

    pub fn query_period(&self) -> u64 {
        self.query_period.unwrap_or(DEFAULT_QUERY_PERIOD_SEC)
    }

    pub fn reset_hour(&self) -> u32 {
        self.reset_hour.unwrap_or(DEFAULT_RESET_HOUR)
    }

    pub fn load() -> Config {
        // parse config from TOML file if present
        let filename = "config.toml";
        let contents = match fs::read_to_string(filename) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Could not read config.toml: {e}");
                "".into()
            }
        };
        let mut config = match toml::from_str::<Config>(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("toml config unparsable: {e}");
                Config::default()
            }
        };

        // overwrite config if environment variables are set
        // $DTU_HOST
        if let Ok(dtu_host) = env::var("DTU_HOST") {
            config.dtu_host = dtu_host;
        }
        // $MQTT_BROKER_HOST
        if let Ok(host) = env::var("MQTT_BROKER_HOST") {
            config.mqtt.host = host;
        }
        // $MQTT_USERNAME (optional)
        if let Ok(username) = env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        // $MQTT_PASSWORD (optional)
        if let Ok(password) = env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        // $MQTT_PORT (optional)
        if let Ok(port) = env::var("MQTT_PORT") {
            config.mqtt.port = Some(port.parse().unwrap_or(1883));
        }
        config
    }
}
