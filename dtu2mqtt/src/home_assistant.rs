//! MQTT message builder for the Home Assistant discovery protocol.
//!
//! Builds two kinds of messages from one plant snapshot: retained discovery
//! configs, published once per process lifetime so that Home Assistant can
//! auto-register every entity, and the recurring state messages carrying the
//! actual readings.
//!
//! More information about the MQTT discovery protocol can be found here:
//! https://www.home-assistant.io/docs/mqtt/discovery/

use chrono::{DateTime, Local, NaiveDate};
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json::{Map, Value};

use crate::entities::{self, EntityDescription, DTU_ENTITIES, MI_ENTITIES, PORT_ENTITIES};
use crate::plant_data::{MicroinverterData, PlantData};
use crate::production::ProductionTracker;

const DISCOVERY_PREFIX: &str = "homeassistant";
const STATE_NAMESPACE: &str = "hoymiles_mqtt";
const MANUFACTURER: &str = "Hoymiles";

/// Display name used in topics and unique ids for DTU-level entities.
const DTU_DEVICE_NAME: &str = "DTU";
/// Display name used for microinverter- and port-level entities.
const MI_DEVICE_NAME: &str = "inv";

fn config_topic(platform: &str, device_serial: &str, entity_id: &str) -> String {
    format!("{DISCOVERY_PREFIX}/{platform}/{device_serial}/{entity_id}/config")
}

fn state_topic(device_serial: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("{DISCOVERY_PREFIX}/{STATE_NAMESPACE}/{device_serial}/{port}/state"),
        None => format!("{DISCOVERY_PREFIX}/{STATE_NAMESPACE}/{device_serial}/state"),
    }
}

/// The device block of a discovery config; groups entities together in the
/// Home Assistant UI.
#[derive(Serialize, Clone)]
struct DeviceConfig {
    name: String,
    identifiers: Vec<String>,
    manufacturer: String,
}

impl DeviceConfig {
    fn new(device_name: &str, device_serial: &str) -> Self {
        Self {
            name: format!("{device_name}_{device_serial}"),
            identifiers: vec![format!("{STATE_NAMESPACE}_{device_serial}")],
            manufacturer: MANUFACTURER.to_string(),
        }
    }
}

/// One entity's discovery config payload. Field order is the serialization
/// order; optional keys are omitted entirely when not set.
#[derive(Serialize)]
struct EntityConfig {
    device: DeviceConfig,
    name: String,
    unique_id: String,
    state_topic: String,
    value_template: String,
    availability_topic: String,
    availability_template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expire_after: Option<String>,
}

/// Construction-time configuration of the message builder.
#[derive(Clone, Debug, Deserialize)]
pub struct HassMqttConfig {
    /// Microinverter entity names that shall be handled by the builder.
    #[serde(default = "entities::all_mi_entity_names")]
    pub mi_entities: Vec<String>,
    /// Port entity names that shall be handled by the builder.
    #[serde(default = "entities::all_port_entity_names")]
    pub port_entities: Vec<String>,
    /// Whether to reconcile production counters against the cache.
    #[serde(default = "default_post_process")]
    pub post_process: bool,
    /// Seconds after which expiry-eligible entities become unavailable when
    /// no update arrives. 0 means entities never expire.
    #[serde(default)]
    pub expire_after: u32,
}

fn default_post_process() -> bool {
    true
}

impl Default for HassMqttConfig {
    fn default() -> Self {
        Self {
            mi_entities: entities::all_mi_entity_names(),
            port_entities: entities::all_port_entity_names(),
            post_process: true,
            expire_after: 0,
        }
    }
}

/// MQTT message builder for Home Assistant.
pub struct HassMqtt {
    mi_entities: Vec<&'static EntityDescription<MicroinverterData>>,
    port_entities: Vec<&'static EntityDescription<MicroinverterData>>,
    post_process: bool,
    expire_after: u32,
    tracker: ProductionTracker,
}

impl HassMqtt {
    pub fn new(config: &HassMqttConfig, tracker: ProductionTracker) -> Self {
        Self {
            mi_entities: entities::select(MI_ENTITIES, &config.mi_entities),
            port_entities: entities::select(PORT_ENTITIES, &config.port_entities),
            post_process: config.post_process,
            expire_after: config.expire_after,
            tracker,
        }
    }

    /// Discovery config messages for every entity of the plant, in catalog
    /// declaration order: DTU first, then per distinct microinverter serial
    /// the microinverter entities followed by its port entities. A serial
    /// appearing on several ports gets its microinverter-level configs only
    /// once; the port-level configs are per port.
    ///
    /// Pure with respect to counter state: safe to call repeatedly, the
    /// coordinator publishes the result only once.
    pub fn get_configs(&self, plant: &PlantData) -> Vec<(String, String)> {
        let dtu_entities: Vec<_> = DTU_ENTITIES.iter().collect();
        let mut messages = Vec::new();
        self.config_messages(&mut messages, DTU_DEVICE_NAME, &plant.dtu, &dtu_entities, None);
        let mut known_serials: Vec<&str> = Vec::new();
        for mi in &plant.microinverter_data {
            if !known_serials.contains(&mi.serial_number.as_str()) {
                known_serials.push(&mi.serial_number);
                self.config_messages(
                    &mut messages,
                    MI_DEVICE_NAME,
                    &mi.serial_number,
                    &self.mi_entities,
                    None,
                );
            }
            self.config_messages(
                &mut messages,
                MI_DEVICE_NAME,
                &mi.serial_number,
                &self.port_entities,
                Some(mi.port_number),
            );
        }
        messages
    }

    fn config_messages<T>(
        &self,
        out: &mut Vec<(String, String)>,
        device_name: &str,
        device_serial: &str,
        entities: &[&EntityDescription<T>],
        port: Option<u16>,
    ) {
        let device = DeviceConfig::new(device_name, device_serial);
        let entity_prefix = match port {
            Some(port) => format!("port_{port}"),
            None => device_name.to_string(),
        };
        for entity in entities {
            let name = entity.name;
            let state_topic = state_topic(device_serial, port);
            let config = EntityConfig {
                device: device.clone(),
                name: if port.is_some() {
                    format!("{entity_prefix}_{name}")
                } else {
                    name.to_string()
                },
                unique_id: format!("{STATE_NAMESPACE}_{entity_prefix}_{device_serial}_{name}"),
                state_topic: state_topic.clone(),
                value_template: format!(
                    "{{{{ iif(value_json.{name} is defined, value_json.{name}, '') }}}}"
                ),
                availability_topic: state_topic,
                availability_template: format!(
                    "{{{{ iif(value_json.{name} is defined, 'online', 'offline') }}}}"
                ),
                device_class: entity.device_class,
                unit_of_measurement: entity.unit,
                state_class: entity.state_class.map(|sc| sc.as_str()),
                expire_after: (entity.expire && self.expire_after > 0)
                    .then(|| self.expire_after.to_string()),
            };
            let topic = config_topic(
                entity.platform.as_str(),
                device_serial,
                &format!("{entity_prefix}_{name}"),
            );
            // EntityConfig has only string map keys, serialization cannot fail
            let payload = serde_json::to_string(&config).unwrap_or_default();
            out.push((topic, payload));
        }
    }

    /// State messages for one snapshot: the DTU state first, then per port
    /// record in snapshot order a microinverter-level message for every
    /// first-seen serial immediately followed by that record's port-level
    /// message.
    ///
    /// With post-processing enabled the snapshot's counters are reconciled
    /// in place before any energy field is read, so this is not idempotent
    /// across calls: a second call sees the updated cache.
    pub fn get_states(
        &mut self,
        plant: &mut PlantData,
        now: DateTime<Local>,
    ) -> Vec<(String, String)> {
        if self.post_process {
            self.tracker.process(plant, now);
        }
        let dtu_entities: Vec<_> = DTU_ENTITIES.iter().collect();
        let mut messages = vec![state_message(&plant.dtu, None, &dtu_entities, plant)];
        let mut known_serials: Vec<&str> = Vec::new();
        for mi in &plant.microinverter_data {
            if !known_serials.contains(&mi.serial_number.as_str()) {
                known_serials.push(&mi.serial_number);
                messages.push(state_message(&mi.serial_number, None, &self.mi_entities, mi));
            }
            messages.push(state_message(
                &mi.serial_number,
                Some(mi.port_number),
                &self.port_entities,
                mi,
            ));
        }
        messages
    }

    /// Clear the daily production cache; guarded to fire at most once per
    /// calendar day.
    pub fn clear_production_today(&mut self, today: NaiveDate) {
        self.tracker.clear_production_today(today);
    }

    /// See [`ProductionTracker::should_reset`].
    pub fn should_reset(&self, now: DateTime<Local>, snapshot: Option<&PlantData>) -> bool {
        self.tracker.should_reset(now, snapshot)
    }
}

fn state_message<T>(
    device_serial: &str,
    port: Option<u16>,
    entities: &[&EntityDescription<T>],
    data: &T,
) -> (String, String) {
    let mut values = Map::new();
    for entity in entities {
        if entity.ignore.is_some_and(|ignore| ignore(data)) {
            continue;
        }
        values.insert(entity.name.to_string(), (entity.value)(data));
    }
    let payload = Value::Object(values).to_string();
    (state_topic(device_serial, port), payload)
}
