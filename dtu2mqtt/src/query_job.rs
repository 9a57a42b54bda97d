//! One poll cycle: query the DTU and publish to the MQTT broker.
//!
//! The scheduler fires on a fixed period and simply calls [`QueryJob::execute`]
//! from a fresh task each time. The job serializes itself: a trigger that
//! arrives while the previous cycle is still running is dropped, not queued.
//! A cycle that takes longer than the period therefore causes skipped polls,
//! never a backlog.

use std::sync::{Mutex, TryLockError};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};

use crate::dtu_client::DtuClient;
use crate::home_assistant::HassMqtt;
use crate::mqtt_wrapper::{MqttWrapper, QoS};

pub struct QueryJob<MQTT: MqttWrapper, DTU: DtuClient> {
    // The lock is owned by this instance, not shared process-wide: two
    // independent jobs (e.g. two DTUs in one process) poll concurrently.
    inner: Mutex<Inner<MQTT, DTU>>,
}

struct Inner<MQTT, DTU> {
    builder: HassMqtt,
    publisher: MQTT,
    client: DTU,
    mqtt_configured: bool,
}

impl<MQTT: MqttWrapper, DTU: DtuClient> QueryJob<MQTT, DTU> {
    pub fn new(builder: HassMqtt, publisher: MQTT, client: DTU) -> Self {
        Self {
            inner: Mutex::new(Inner {
                builder,
                publisher,
                client,
                mqtt_configured: false,
            }),
        }
    }

    /// Run one poll cycle. Safe to call concurrently: at most one cycle runs
    /// at a time, additional triggers return immediately without touching
    /// the DTU, the cache or the broker.
    pub fn execute(&self) {
        self.execute_at(Local::now());
    }

    /// Run one poll cycle with an explicit cycle timestamp. The timestamp
    /// drives the daily-reset window detection.
    pub fn execute_at(&self, now: DateTime<Local>) {
        let mut inner = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                debug!("previous query cycle still running, skipping this trigger");
                return;
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                // A panicked cycle must not take the scheduler down with it.
                warn!("previous query cycle panicked, continuing with the next one");
                poisoned.into_inner()
            }
        };
        inner.run_cycle(now);
        // the guard releases the lock on every exit path
    }

    /// Block until any in-flight cycle has finished. Used by graceful
    /// shutdown to let the last poll complete before the process exits.
    pub fn wait_idle(&self) {
        let _unused = self.inner.lock();
    }
}

impl<MQTT: MqttWrapper, DTU: DtuClient> Inner<MQTT, DTU> {
    fn run_cycle(&mut self, now: DateTime<Local>) {
        if self.builder.should_reset(now, None) {
            info!("reset hour reached");
            self.builder.clear_production_today(now.date_naive());
        }

        debug!("reading data from DTU");
        let mut plant = match self.client.plant_data() {
            Ok(plant) => plant,
            Err(e) if e.is_transient() => {
                warn!("failed to read data from DTU, will retry: {e}");
                return;
            }
            Err(e) => {
                error!("failed to read data from DTU: {e:?}");
                return;
            }
        };
        if plant.microinverter_data.is_empty() {
            warn!("no DTU data received");
            return;
        }

        // Publish failures are logged and the remaining messages of the
        // batch are still attempted; the next cycle refreshes the states.
        let mut published = 0_usize;
        if !self.mqtt_configured {
            for (topic, payload) in self.builder.get_configs(&plant) {
                match self.publisher.publish(topic.as_str(), QoS::AtMostOnce, true, payload) {
                    Ok(()) => published += 1,
                    Err(e) => error!("failed to publish config to {topic}: {e:?}"),
                }
            }
            self.mqtt_configured = true;
        }
        for (topic, payload) in self.builder.get_states(&mut plant, now) {
            match self.publisher.publish(topic.as_str(), QoS::AtMostOnce, false, payload) {
                Ok(()) => published += 1,
                Err(e) => error!("failed to publish state to {topic}: {e:?}"),
            }
        }
        info!("DTU data received, published {published} messages");
    }
}
