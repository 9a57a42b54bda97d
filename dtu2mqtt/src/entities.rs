//! Entity catalogs for the Home Assistant MQTT discovery protocol.
//!
//! Every published measurement is described once, at compile time, by an
//! [`EntityDescription`]. The value accessor is a plain function pointer so
//! there is no field lookup by name at runtime; the catalogs are closed and
//! their iteration order is the declaration order, which in turn fixes the
//! order of the emitted discovery messages.

use serde_json::{json, Value};

use crate::plant_data::{MicroinverterData, PlantData};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Sensor,
    BinarySensor,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Sensor => "sensor",
            Platform::BinarySensor => "binary_sensor",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

impl StateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateClass::Measurement => "measurement",
            StateClass::TotalIncreasing => "total_increasing",
        }
    }
}

/// Immutable metadata for one entity.
///
/// `ignore` suppresses the entity from a state payload for the current
/// record; the key is then entirely absent, which the availability template
/// in the discovery config translates to "offline".
pub struct EntityDescription<T> {
    pub name: &'static str,
    pub platform: Platform,
    pub device_class: Option<&'static str>,
    pub unit: Option<&'static str>,
    pub state_class: Option<StateClass>,
    /// Whether the `expire_after` setting applies. Counters that represent
    /// a total amount never expire.
    pub expire: bool,
    pub ignore: Option<fn(&T) -> bool>,
    pub value: fn(&T) -> Value,
}

/// DTU-level entities, published under the DTU serial.
pub const DTU_ENTITIES: &[EntityDescription<PlantData>] = &[
    EntityDescription {
        name: "pv_power",
        platform: Platform::Sensor,
        device_class: Some("power"),
        unit: Some("W"),
        state_class: Some(StateClass::Measurement),
        expire: true,
        ignore: None,
        value: |plant| json!(plant.pv_power),
    },
    EntityDescription {
        name: "today_production",
        platform: Platform::Sensor,
        device_class: Some("energy"),
        unit: Some("Wh"),
        state_class: Some(StateClass::TotalIncreasing),
        expire: false,
        ignore: Some(|plant| plant.today_production == 0),
        value: |plant| json!(plant.today_production),
    },
    EntityDescription {
        name: "total_production",
        platform: Platform::Sensor,
        device_class: Some("energy"),
        unit: Some("Wh"),
        state_class: Some(StateClass::TotalIncreasing),
        expire: false,
        ignore: Some(|plant| plant.total_production == 0),
        value: |plant| json!(plant.total_production),
    },
    EntityDescription {
        name: "alarm_flag",
        platform: Platform::BinarySensor,
        device_class: Some("problem"),
        unit: None,
        state_class: None,
        expire: true,
        ignore: None,
        value: |plant| json!(if plant.alarm_flag { "ON" } else { "OFF" }),
    },
];

/// Microinverter-level entities, published once per distinct serial number.
pub const MI_ENTITIES: &[EntityDescription<MicroinverterData>] = &[
    EntityDescription {
        name: "grid_voltage",
        platform: Platform::Sensor,
        device_class: Some("voltage"),
        unit: Some("V"),
        state_class: Some(StateClass::Measurement),
        expire: true,
        ignore: Some(|mi| mi.operating_status == 0),
        value: |mi| json!(mi.grid_voltage),
    },
    EntityDescription {
        name: "grid_frequency",
        platform: Platform::Sensor,
        device_class: Some("frequency"),
        unit: Some("Hz"),
        state_class: Some(StateClass::Measurement),
        expire: true,
        ignore: Some(|mi| mi.operating_status == 0),
        value: |mi| json!(mi.grid_frequency),
    },
    EntityDescription {
        name: "temperature",
        platform: Platform::Sensor,
        device_class: Some("temperature"),
        unit: Some("°C"),
        state_class: Some(StateClass::Measurement),
        expire: true,
        ignore: Some(|mi| mi.operating_status == 0),
        value: |mi| json!(mi.temperature),
    },
    EntityDescription {
        name: "operating_status",
        platform: Platform::Sensor,
        device_class: None,
        unit: None,
        state_class: None,
        expire: true,
        ignore: None,
        value: |mi| json!(mi.operating_status),
    },
    EntityDescription {
        name: "alarm_code",
        platform: Platform::Sensor,
        device_class: None,
        unit: None,
        state_class: None,
        expire: true,
        ignore: None,
        value: |mi| json!(mi.alarm_code),
    },
    EntityDescription {
        name: "alarm_count",
        platform: Platform::Sensor,
        device_class: None,
        unit: None,
        state_class: None,
        expire: true,
        ignore: None,
        value: |mi| json!(mi.alarm_count),
    },
    EntityDescription {
        name: "link_status",
        platform: Platform::Sensor,
        device_class: None,
        unit: None,
        state_class: None,
        expire: true,
        ignore: None,
        value: |mi| json!(mi.link_status),
    },
];

/// Port-level entities (in fact PV panel entities), one set per port record.
pub const PORT_ENTITIES: &[EntityDescription<MicroinverterData>] = &[
    EntityDescription {
        name: "pv_voltage",
        platform: Platform::Sensor,
        device_class: Some("voltage"),
        unit: Some("V"),
        state_class: Some(StateClass::Measurement),
        expire: true,
        ignore: Some(|mi| mi.operating_status == 0),
        value: |mi| json!(mi.pv_voltage),
    },
    EntityDescription {
        name: "pv_current",
        platform: Platform::Sensor,
        device_class: Some("current"),
        unit: Some("A"),
        state_class: Some(StateClass::Measurement),
        expire: true,
        ignore: Some(|mi| mi.operating_status == 0),
        value: |mi| json!(mi.pv_current),
    },
    EntityDescription {
        name: "pv_power",
        platform: Platform::Sensor,
        device_class: Some("power"),
        unit: Some("W"),
        state_class: Some(StateClass::Measurement),
        expire: true,
        ignore: Some(|mi| mi.operating_status == 0),
        value: |mi| json!(mi.pv_power),
    },
    EntityDescription {
        name: "today_production",
        platform: Platform::Sensor,
        device_class: Some("energy"),
        unit: Some("Wh"),
        state_class: Some(StateClass::TotalIncreasing),
        expire: false,
        ignore: None,
        value: |mi| json!(mi.today_production),
    },
    EntityDescription {
        name: "total_production",
        platform: Platform::Sensor,
        device_class: Some("energy"),
        unit: Some("Wh"),
        state_class: Some(StateClass::TotalIncreasing),
        expire: false,
        ignore: None,
        value: |mi| json!(mi.total_production),
    },
];

/// Select catalog entries by name, preserving the catalog declaration order.
pub fn select<'a, T>(
    catalog: &'a [EntityDescription<T>],
    names: &[String],
) -> Vec<&'a EntityDescription<T>> {
    catalog
        .iter()
        .filter(|entity| names.iter().any(|name| name == entity.name))
        .collect()
}

/// All microinverter-level entity names, in catalog order.
pub fn all_mi_entity_names() -> Vec<String> {
    MI_ENTITIES.iter().map(|e| e.name.to_string()).collect()
}

/// All port-level entity names, in catalog order.
pub fn all_port_entity_names() -> Vec<String> {
    PORT_ENTITIES.iter().map(|e| e.name.to_string()).collect()
}
