use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use dtu2mqtt::dtu_client::{DtuClient, DtuError};
use dtu2mqtt::home_assistant::{HassMqtt, HassMqttConfig};
use dtu2mqtt::mqtt_config::MqttConfig;
use dtu2mqtt::mqtt_wrapper::{MqttWrapper, QoS};
use dtu2mqtt::plant_data::{MicroinverterData, PlantData};
use dtu2mqtt::production::{ActivityCheck, ProductionTracker, ResetHeuristic, DEFAULT_RESET_HOUR};
use dtu2mqtt::query_job::QueryJob;

#[derive(Clone, Debug)]
struct Published {
    topic: String,
    retain: bool,
    payload: Vec<u8>,
}

/// In-memory MQTT client; the shared handle stays inspectable after the
/// tester has been moved into a job.
#[derive(Clone)]
struct MqttTester {
    published_values: Arc<Mutex<Vec<Published>>>,
    /// Fail this many leading publishes before succeeding again.
    fail_first: Arc<AtomicUsize>,
}

impl MqttTester {
    fn with_log() -> (Self, Arc<Mutex<Vec<Published>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                published_values: log.clone(),
                fail_first: Arc::new(AtomicUsize::new(0)),
            },
            log,
        )
    }

    fn len(&self) -> usize {
        self.published_values.lock().unwrap().len()
    }

    #[must_use]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MqttWrapper for MqttTester {
    fn publish<S, V>(&mut self, topic: S, _qos: QoS, retain: bool, payload: V) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>,
    {
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("broker rejected the message");
        }
        self.published_values.lock().unwrap().push(Published {
            topic: topic.into(),
            retain,
            payload: payload.into(),
        });
        Ok(())
    }

    fn new(_config: &MqttConfig, _suffix: &str) -> Self {
        Self {
            published_values: Arc::new(Mutex::new(Vec::new())),
            fail_first: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn example_plant() -> PlantData {
    PlantData {
        dtu: "dtu_serial".to_string(),
        microinverter_data: vec![MicroinverterData {
            serial_number: "102162804827".to_string(),
            port_number: 3,
            pv_voltage: 1.234,
            pv_current: 2.34,
            grid_voltage: 22.33,
            grid_frequency: 32.12,
            pv_power: 40.31,
            today_production: 431,
            total_production: 8844,
            temperature: 20.4,
            operating_status: 3,
            alarm_code: 0,
            alarm_count: 2,
            link_status: 1,
            ..Default::default()
        }],
        ..Default::default()
    }
}

/// Scripted DTU: pops the next canned response per poll, keeps counting.
struct FakeDtu {
    responses: Mutex<Vec<Result<PlantData, DtuError>>>,
    fetches: Arc<AtomicUsize>,
}

impl FakeDtu {
    fn new(responses: Vec<Result<PlantData, DtuError>>) -> (Self, Arc<AtomicUsize>) {
        let fetches = Arc::new(AtomicUsize::new(0));
        (
            Self {
                responses: Mutex::new(responses),
                fetches: fetches.clone(),
            },
            fetches,
        )
    }
}

impl DtuClient for FakeDtu {
    fn plant_data(&mut self) -> Result<PlantData, DtuError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(example_plant())
        } else {
            responses.remove(0)
        }
    }
}

fn builder() -> HassMqtt {
    HassMqtt::new(
        &HassMqttConfig::default(),
        ProductionTracker::new(
            ActivityCheck::OperatingStatus,
            DEFAULT_RESET_HOUR,
            ResetHeuristic::HourOnly,
        ),
    )
}

fn noon() -> DateTime<Local> {
    Local.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap()
}

#[test]
fn publish_one_message() {
    let mut mqtt = MqttTester::new(
        &MqttConfig {
            host: "frob".to_owned(),
            port: Some(1234),
            username: None,
            password: None,
            client_id: Some("myclient".to_string()),
            tls: None,
            tls_insecure: None,
        },
        "-test",
    );
    let result = mqtt.publish("foo", QoS::AtMostOnce, true, "Hooray".to_string());
    assert!(result.is_ok());
    assert!(!mqtt.is_empty());
    assert_eq!(mqtt.len(), 1);
}

#[test]
fn configs_published_once_states_every_cycle() {
    let (mqtt, log) = MqttTester::with_log();
    let (dtu, fetches) = FakeDtu::new(vec![]);
    let job = QueryJob::new(builder(), mqtt, dtu);

    job.execute_at(noon());
    job.execute_at(noon());

    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    let log = log.lock().unwrap();
    let configs: Vec<_> = log.iter().filter(|m| m.topic.ends_with("/config")).collect();
    let states: Vec<_> = log.iter().filter(|m| m.topic.ends_with("/state")).collect();
    // one config batch: 4 DTU + 7 microinverter + 5 port entities
    assert_eq!(configs.len(), 16);
    // two state batches of DTU + microinverter + port message
    assert_eq!(states.len(), 6);
    assert!(configs.iter().all(|m| m.retain));
    assert!(states.iter().all(|m| !m.retain));
}

#[test]
fn config_batch_precedes_states_in_catalog_order() {
    let (mqtt, log) = MqttTester::with_log();
    let (dtu, _) = FakeDtu::new(vec![]);
    let job = QueryJob::new(builder(), mqtt, dtu);
    job.execute_at(noon());

    let log = log.lock().unwrap();
    let topics: Vec<&str> = log.iter().map(|m| m.topic.as_str()).collect();
    assert_eq!(topics[0], "homeassistant/sensor/dtu_serial/DTU_pv_power/config");
    assert_eq!(
        topics[..4],
        [
            "homeassistant/sensor/dtu_serial/DTU_pv_power/config",
            "homeassistant/sensor/dtu_serial/DTU_today_production/config",
            "homeassistant/sensor/dtu_serial/DTU_total_production/config",
            "homeassistant/binary_sensor/dtu_serial/DTU_alarm_flag/config",
        ]
    );
    // states follow the whole config batch
    assert_eq!(topics[16], "homeassistant/hoymiles_mqtt/dtu_serial/state");
    let port_state = log
        .iter()
        .find(|m| m.topic == "homeassistant/hoymiles_mqtt/102162804827/3/state")
        .expect("port state published");
    let payload: serde_json::Value = serde_json::from_slice(&port_state.payload).unwrap();
    assert_eq!(payload["pv_voltage"], serde_json::json!(1.234));
    assert_eq!(payload["today_production"], serde_json::json!(431));
    assert_eq!(payload["total_production"], serde_json::json!(8844));
}

#[test]
fn transient_fetch_error_publishes_nothing() {
    let (mqtt, log) = MqttTester::with_log();
    let (dtu, _) = FakeDtu::new(vec![
        Err(DtuError::NoResponse("expected at least 8 bytes".to_string())),
        Ok(example_plant()),
    ]);
    let job = QueryJob::new(builder(), mqtt, dtu);

    job.execute_at(noon());
    assert!(log.lock().unwrap().is_empty());

    // the configs-published flag was left untouched: the next successful
    // cycle still publishes the config batch
    job.execute_at(noon());
    let configs = log
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.topic.ends_with("/config"))
        .count();
    assert_eq!(configs, 16);
}

#[test]
fn unknown_fetch_error_publishes_nothing() {
    let (mqtt, log) = MqttTester::with_log();
    let (dtu, _) = FakeDtu::new(vec![Err(DtuError::Protocol("garbled frame".to_string()))]);
    let job = QueryJob::new(builder(), mqtt, dtu);
    job.execute_at(noon());
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn empty_snapshot_publishes_nothing() {
    let (mqtt, log) = MqttTester::with_log();
    let (dtu, _) = FakeDtu::new(vec![Ok(PlantData::new("dtu_serial"))]);
    let job = QueryJob::new(builder(), mqtt, dtu);
    job.execute_at(noon());
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn publish_failure_does_not_stop_the_batch() {
    let (mqtt, log) = MqttTester::with_log();
    mqtt.fail_first.store(2, Ordering::SeqCst);
    let (dtu, _) = FakeDtu::new(vec![]);
    let job = QueryJob::new(builder(), mqtt, dtu);
    job.execute_at(noon());

    // two config messages lost, the rest of the batch still went out
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 17);

    // and the config batch is not repeated on the next cycle
    drop(log);
    job.execute_at(noon());
}

#[test]
fn reset_hour_cycle_rebaselines_daily_counters() {
    let reset_time = Local.with_ymd_and_hms(2026, 8, 30, DEFAULT_RESET_HOUR, 5, 0).unwrap();
    let mut after_reset = example_plant();
    after_reset.microinverter_data[0].today_production = 2;
    after_reset.microinverter_data[0].total_production = 8846;

    let (mqtt, log) = MqttTester::with_log();
    let (dtu, _) = FakeDtu::new(vec![Ok(example_plant()), Ok(after_reset)]);
    let job = QueryJob::new(builder(), mqtt, dtu);

    job.execute_at(noon());
    job.execute_at(reset_time);

    let log = log.lock().unwrap();
    let dtu_states: Vec<serde_json::Value> = log
        .iter()
        .filter(|m| m.topic == "homeassistant/hoymiles_mqtt/dtu_serial/state")
        .map(|m| serde_json::from_slice(&m.payload).unwrap())
        .collect();
    assert_eq!(dtu_states[0]["today_production"], serde_json::json!(431));
    // daily counter restarted from scratch without a regression repair
    assert_eq!(dtu_states[1]["today_production"], serde_json::json!(2));
    assert_eq!(dtu_states[1]["total_production"], serde_json::json!(8846));
}

#[test]
fn concurrent_trigger_is_dropped() {
    let (mqtt, log) = MqttTester::with_log();

    // DTU that blocks until released, so the first cycle stays in flight
    struct BlockingDtu {
        gate: std::sync::mpsc::Receiver<()>,
        fetches: Arc<AtomicUsize>,
    }
    impl DtuClient for BlockingDtu {
        fn plant_data(&mut self) -> Result<PlantData, DtuError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.gate.recv().expect("gate sender dropped");
            Ok(example_plant())
        }
    }

    let (release, gate): (Sender<()>, _) = channel();
    let fetches = Arc::new(AtomicUsize::new(0));
    let dtu = BlockingDtu {
        gate,
        fetches: fetches.clone(),
    };
    let job = Arc::new(QueryJob::new(builder(), mqtt, dtu));

    let first = {
        let job = job.clone();
        thread::spawn(move || job.execute_at(noon()))
    };
    while fetches.load(Ordering::SeqCst) == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    // second trigger returns immediately: no fetch, no publish
    job.execute_at(noon());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(log.lock().unwrap().is_empty());

    release.send(()).unwrap();
    first.join().unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(log.lock().unwrap().len(), 19);

    // once released, the next trigger polls again
    release.send(()).unwrap();
    job.execute_at(noon());
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}
