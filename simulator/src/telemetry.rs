use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Capacitive soil sensor output, in millivolts, for bone dry and saturated soil.
const SOIL_DRY_MV: f64 = 3000.0;
const SOIL_WET_MV: f64 = 1200.0;
const LIGHT_FULL_MV: f64 = 3300.0;

const DRYING_PER_TICK: f64 = 0.4;
const WATERING_PER_TICK: f64 = 6.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub soil_mv: f64,
    pub soil_pct: f64,
    pub light_mv: f64,
    pub light_pct: f64,
    pub temp_c: f64,
    pub humidity_pct: f64,
    pub pump_running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Hello {
    #[serde(rename = "claimCode")]
    pub claim_code: String,
    pub fw: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub water_ms: u64,
}

/// One simulated controller: a soil sensor that dries out over time and a
/// pump that wets it while running.
#[derive(Debug)]
pub struct SimDevice {
    pub id: String,
    soil_pct: f64,
    pump_until: Option<Instant>,
}

impl SimDevice {
    pub fn new(id: impl Into<String>, rng: &mut impl Rng) -> Self {
        Self {
            id: id.into(),
            soil_pct: rng.gen_range(20.0..70.0),
            pump_until: None,
        }
    }

    /// `water_ms > 0` runs the pump for that long, `0` stops it.
    pub fn apply_command(&mut self, cmd: Command, now: Instant) {
        self.pump_until = match cmd.water_ms {
            0 => None,
            ms => Some(now + Duration::from_millis(ms)),
        };
    }

    pub fn pump_running(&self, now: Instant) -> bool {
        self.pump_until.map_or(false, |until| now < until)
    }

    pub fn next_reading(&mut self, rng: &mut impl Rng, now: Instant) -> Reading {
        let pump_running = self.pump_running(now);
        if !pump_running {
            self.pump_until = None;
        }

        let delta = if pump_running {
            WATERING_PER_TICK
        } else {
            -DRYING_PER_TICK
        };
        self.soil_pct = (self.soil_pct + delta + rng.gen_range(-0.2..0.2)).clamp(0.0, 100.0);

        let light_mv: f64 = rng.gen_range(0.0..LIGHT_FULL_MV);

        Reading {
            soil_mv: round1(soil_mv_for(self.soil_pct)),
            soil_pct: round1(self.soil_pct),
            light_mv: round1(light_mv),
            light_pct: round1(light_mv / LIGHT_FULL_MV * 100.0),
            temp_c: round1(rng.gen_range(15.0..32.0)),
            humidity_pct: round1(rng.gen_range(30.0..85.0)),
            pump_running,
        }
    }
}

fn soil_mv_for(pct: f64) -> f64 {
    SOIL_DRY_MV - (SOIL_DRY_MV - SOIL_WET_MV) * pct / 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

pub fn claim_code(rng: &mut impl Rng) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
