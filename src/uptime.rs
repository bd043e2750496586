//! Per-hour maker uptime accounting.
//!
//! Exchange eligibility wants >=30 minutes per clock-hour of two-sided
//! quoting at a tight spread. Every engine tick reports whether both sides
//! were resting and at which configured spread; elapsed time is split into
//! a maker band (spread <= 5 bps) and a wider mm band.

use crate::utils::epoch_secs;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::info;

/// Spread ceiling for the maker-eligible band.
pub const MAKER_MAX_SPREAD_BPS: f64 = 5.0;

/// Cap on a single tick's elapsed time; absorbs host sleeps and stalls.
const ELAPSED_CAP_SECS: f64 = 10.0;

const HISTORY_HOURS: usize = 24;
const HOUR_SECS: f64 = 3600.0;

/// Accounting for one clock-hour.
#[derive(Debug, Clone, Serialize)]
pub struct HourlyRecord {
    pub hour_start: f64,
    pub maker_active_seconds: f64,
    pub mm_active_seconds: f64,
    pub total_elapsed_seconds: f64,
    pub target_seconds: f64,
}

impl HourlyRecord {
    fn new(hour_start: f64, target_seconds: f64) -> Self {
        Self {
            hour_start,
            maker_active_seconds: 0.0,
            mm_active_seconds: 0.0,
            total_elapsed_seconds: 0.0,
            target_seconds,
        }
    }

    pub fn maker_uptime_pct(&self) -> f64 {
        (self.maker_active_seconds / HOUR_SECS * 100.0).min(100.0)
    }

    pub fn mm_uptime_pct(&self) -> f64 {
        (self.mm_active_seconds / HOUR_SECS * 100.0).min(100.0)
    }

    pub fn maker_target_met(&self) -> bool {
        self.maker_active_seconds >= self.target_seconds
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentHourStats {
    #[serde(flatten)]
    pub record: HourlyRecord,
    pub maker_uptime_pct: f64,
    pub mm_uptime_pct: f64,
    pub maker_target_met: bool,
    pub seconds_remaining_for_target: f64,
    pub seconds_elapsed_in_hour: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UptimeStats {
    pub current_hour: CurrentHourStats,
    pub history: Vec<HourlyRecord>,
    pub hours_target_met_last_24h: usize,
    pub avg_maker_uptime_pct_last_24h: f64,
    pub avg_mm_uptime_pct_last_24h: f64,
}

struct TrackerState {
    current_hour: f64,
    current: HourlyRecord,
    history: VecDeque<HourlyRecord>,
    last_tick: f64,
    is_active: bool,
}

/// Owns the hourly record; only the engine tick mutates it.
pub struct UptimeTracker {
    target_seconds: f64,
    state: Mutex<TrackerState>,
}

fn hour_start_of(now: f64) -> f64 {
    now - now % HOUR_SECS
}

impl UptimeTracker {
    pub fn new(target_seconds: f64) -> Self {
        let now = epoch_secs();
        let hour = hour_start_of(now);
        Self {
            target_seconds,
            state: Mutex::new(TrackerState {
                current_hour: hour,
                current: HourlyRecord::new(hour, target_seconds),
                history: VecDeque::with_capacity(HISTORY_HOURS),
                last_tick: now,
                is_active: false,
            }),
        }
    }

    /// Account one engine tick.
    pub fn tick(&self, has_both_sides: bool, spread_bps: f64) {
        self.tick_at(epoch_secs(), has_both_sides, spread_bps);
    }

    fn tick_at(&self, now: f64, has_both_sides: bool, spread_bps: f64) {
        let mut state = self.state.lock().unwrap();
        let elapsed = (now - state.last_tick).clamp(0.0, ELAPSED_CAP_SECS);
        state.last_tick = now;

        let current_hour = hour_start_of(now);
        if current_hour != state.current_hour {
            let finished = std::mem::replace(
                &mut state.current,
                HourlyRecord::new(current_hour, self.target_seconds),
            );
            info!(
                hour = finished.hour_start,
                maker_active = finished.maker_active_seconds,
                mm_active = finished.mm_active_seconds,
                target_met = finished.maker_target_met(),
                "uptime hour rollover"
            );
            if state.history.len() == HISTORY_HOURS {
                state.history.pop_front();
            }
            state.history.push_back(finished);
            state.current_hour = current_hour;
        }

        // never let the record exceed one hour of accounted time
        let add = elapsed.min(HOUR_SECS - state.current.total_elapsed_seconds);
        state.current.total_elapsed_seconds += add;

        if has_both_sides {
            if spread_bps <= MAKER_MAX_SPREAD_BPS {
                state.current.maker_active_seconds += add;
            } else {
                state.current.mm_active_seconds += add;
            }
            if !state.is_active {
                info!("uptime: both sides resting, now active");
                state.is_active = true;
            }
        } else if state.is_active {
            info!("uptime: lost a side, now inactive");
            state.is_active = false;
        }
    }

    /// Wipe the current record and history. Used on symbol switch.
    pub fn reset(&self) {
        let now = epoch_secs();
        let hour = hour_start_of(now);
        let mut state = self.state.lock().unwrap();
        state.current_hour = hour;
        state.current = HourlyRecord::new(hour, self.target_seconds);
        state.history.clear();
        state.last_tick = now;
        state.is_active = false;
    }

    pub fn maker_uptime_pct(&self) -> f64 {
        self.state.lock().unwrap().current.maker_uptime_pct()
    }

    pub fn stats(&self) -> UptimeStats {
        let state = self.state.lock().unwrap();
        let record = state.current.clone();
        let history: Vec<HourlyRecord> = state.history.iter().cloned().collect();
        let met = history.iter().filter(|r| r.maker_target_met()).count();
        let (avg_maker, avg_mm) = if history.is_empty() {
            (0.0, 0.0)
        } else {
            let n = history.len() as f64;
            (
                history.iter().map(|r| r.maker_uptime_pct()).sum::<f64>() / n,
                history.iter().map(|r| r.mm_uptime_pct()).sum::<f64>() / n,
            )
        };
        UptimeStats {
            current_hour: CurrentHourStats {
                maker_uptime_pct: record.maker_uptime_pct(),
                mm_uptime_pct: record.mm_uptime_pct(),
                maker_target_met: record.maker_target_met(),
                seconds_remaining_for_target: (self.target_seconds
                    - record.maker_active_seconds)
                    .max(0.0),
                seconds_elapsed_in_hour: epoch_secs() - state.current_hour,
                is_active: state.is_active,
                record,
            },
            history,
            hours_target_met_last_24h: met,
            avg_maker_uptime_pct_last_24h: avg_maker,
            avg_mm_uptime_pct_last_24h: avg_mm,
        }
    }
}
