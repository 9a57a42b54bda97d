//! Reconciliation of cumulative production counters.
//!
//! DTUs occasionally serve stale or garbage register reads, most visibly on
//! the daily and lifetime energy counters. The tracker keeps the last
//! accepted value per (serial, port) and repairs any reading that would make
//! a counter go backwards, so that Home Assistant's `total_increasing`
//! statistics are never corrupted by a single bad poll. The daily counter is
//! allowed to restart from zero once per calendar day, inside the configured
//! reset hour.

use std::collections::HashMap;

use chrono::{DateTime, Local, NaiveDate, Timelike};
use log::{debug, warn};
use serde_derive::Deserialize;

use crate::plant_data::{MicroinverterData, PlantData};

/// Hour of day in which the DTU resets the daily production counters.
pub const DEFAULT_RESET_HOUR: u32 = 23;

/// Which field decides whether a record's counter readings are trustworthy.
///
/// Firmware revisions differ: some DTUs report a meaningful operating
/// status, others only a usable link status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityCheck {
    #[default]
    OperatingStatus,
    LinkStatus,
}

/// How to decide that the daily reset window has actually been reached.
///
/// `HourOnly` trusts the wall clock alone. `HourAndNoProduction`
/// additionally requires that no active record reported a daily counter in
/// the snapshot, to distinguish "counters were reset" from "no data yet".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetHeuristic {
    #[default]
    HourOnly,
    HourAndNoProduction,
}

type CacheKey = (String, u16);

/// Stateful cache of last accepted production counters per (serial, port).
pub struct ProductionTracker {
    activity_check: ActivityCheck,
    reset_hour: u32,
    heuristic: ResetHeuristic,
    today_cache: HashMap<CacheKey, u32>,
    total_cache: HashMap<CacheKey, u64>,
    last_reset: Option<NaiveDate>,
}

impl ProductionTracker {
    pub fn new(activity_check: ActivityCheck, reset_hour: u32, heuristic: ResetHeuristic) -> Self {
        Self {
            activity_check,
            reset_hour,
            heuristic,
            today_cache: HashMap::new(),
            total_cache: HashMap::new(),
            last_reset: None,
        }
    }

    fn is_active(&self, mi: &MicroinverterData) -> bool {
        match self.activity_check {
            ActivityCheck::OperatingStatus => mi.operating_status > 0,
            ActivityCheck::LinkStatus => mi.link_status > 0,
        }
    }

    /// Whether the daily cache should be cleared now.
    ///
    /// Returns false outside the reset hour and after a reset already
    /// happened today; the stored last-reset day makes the decision
    /// idempotent no matter how many polls land inside the reset hour.
    /// `snapshot` is consulted only by [`ResetHeuristic::HourAndNoProduction`];
    /// callers that have not fetched yet pass `None`, which that heuristic
    /// treats as "not enough evidence".
    pub fn should_reset(&self, now: DateTime<Local>, snapshot: Option<&PlantData>) -> bool {
        if now.hour() != self.reset_hour {
            return false;
        }
        if self.last_reset == Some(now.date_naive()) {
            return false;
        }
        match self.heuristic {
            ResetHeuristic::HourOnly => true,
            ResetHeuristic::HourAndNoProduction => snapshot.is_some_and(|plant| {
                plant
                    .microinverter_data
                    .iter()
                    .filter(|mi| self.is_active(mi))
                    .all(|mi| mi.today_production == 0)
            }),
        }
    }

    /// Clear the daily production cache. At most once per calendar day;
    /// repeated calls within the same day are no-ops. The lifetime counters
    /// are never cleared.
    pub fn clear_production_today(&mut self, today: NaiveDate) {
        if self.last_reset == Some(today) {
            debug!("today production cache already cleared on {today}");
            return;
        }
        debug!("clearing today production cache");
        self.today_cache.clear();
        self.last_reset = Some(today);
    }

    /// Validate and repair the production counters of every record, then
    /// overwrite the plant-level aggregates with the sums of the cache.
    ///
    /// Counter regressions are data-quality faults, not errors: the record
    /// is patched with the cached value and a warning is logged.
    pub fn process(&mut self, plant: &mut PlantData, now: DateTime<Local>) {
        if self.should_reset(now, Some(plant)) {
            self.clear_production_today(now.date_naive());
        }

        for mi in plant.microinverter_data.iter_mut() {
            let key = (mi.serial_number.clone(), mi.port_number);
            let active = self.is_active(mi);

            // Unknown keys start at zero so that a sleeping inverter's
            // leftover register garbage can never become the baseline.
            let cached_today = self.today_cache.entry(key.clone()).or_insert(0);
            if active {
                if mi.today_production >= *cached_today {
                    *cached_today = mi.today_production;
                } else {
                    warn!(
                        "today production for {} port {} is smaller ({}) than cache ({}), ignoring the fault value",
                        mi.serial_number, mi.port_number, mi.today_production, cached_today
                    );
                    mi.today_production = *cached_today;
                }
            } else {
                // Sleeping inverters keep reporting whatever is left in the
                // DTU registers; report the last trusted value instead.
                mi.today_production = *cached_today;
            }

            let cached_total = self.total_cache.entry(key).or_insert(0);
            if active {
                if mi.total_production >= *cached_total {
                    *cached_total = mi.total_production;
                } else {
                    warn!(
                        "total production for {} port {} is smaller ({}) than cache ({}), ignoring the fault value",
                        mi.serial_number, mi.port_number, mi.total_production, cached_total
                    );
                    mi.total_production = *cached_total;
                }
            } else {
                mi.total_production = *cached_total;
            }
        }

        plant.today_production = self.today_cache.values().map(|v| u64::from(*v)).sum();
        plant.total_production = self.total_cache.values().sum();
    }
}
