// The safety supervisor: derives a safe/unsafe verdict from pack state and
// computes the charge/discharge current envelopes the inverter driver is
// allowed to advertise.
//
// The verdict is represented as an opaque token rather than a bool so that
// a zero-initialised or otherwise-forged value can never be mistaken for
// "safe" — see DESIGN.md and §9 of SPEC_FULL.md.

use rand::Rng;

use crate::config::BatteryConfig;
use crate::pack::PackState;

const MIN_TEMP_FLOOR_DC: i32 = -250; // -25.0 degC
const MAX_TEMP_CEIL_DC: i32 = 500; // 50.0 degC
const MAX_TEMP_SPREAD_DC: i32 = 150; // 15.0 degC

/// Two distinct random sentinels drawn once at startup. `issafe` aborts on
/// any value that is neither, which is only reachable by a logic bug (the
/// opaque-token pattern prevents forging "safe" via zero-initialisation).
pub struct Safety {
    safe_token: u32,
    unsafe_token: u32,
    last_reason: Option<&'static str>,
}

impl Safety {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let safe_token: u32 = rng.gen();
        let mut unsafe_token: u32 = rng.gen();
        while unsafe_token == safe_token {
            unsafe_token = rng.gen();
        }
        Safety {
            safe_token,
            unsafe_token,
            last_reason: None,
        }
    }

    pub fn safe_token(&self) -> u32 {
        self.safe_token
    }

    pub fn unsafe_token(&self) -> u32 {
        self.unsafe_token
    }

    /// Returns whether `token` is the safe sentinel. Aborts on any value
    /// that is neither sentinel (§7.9, P7).
    pub fn issafe(&self, token: u32) -> bool {
        if token == self.safe_token {
            true
        } else if token == self.unsafe_token {
            false
        } else {
            panic!("opaque safety token {token:#x} is neither sentinel — corrupted state");
        }
    }

    /// Evaluate the current pack state and config against the checklist in
    /// §4.D, logging a warning the first time the unsafe reason changes.
    pub fn evaluate(&mut self, pack: &PackState, config: &BatteryConfig) -> u32 {
        match check(pack, config) {
            Ok(()) => {
                self.last_reason = None;
                self.safe_token
            }
            Err(reason) => {
                if self.last_reason != Some(reason) {
                    log::warn!("pack unsafe: {reason}");
                    self.last_reason = Some(reason);
                }
                self.unsafe_token
            }
        }
    }
}

fn check(pack: &PackState, config: &BatteryConfig) -> Result<(), &'static str> {
    if !pack.running() {
        return Err("battery is not running");
    }

    let min_temp = pack
        .min_temp_dc()
        .ok_or("minimum battery temperature has not been reported")?;
    let max_temp = pack
        .max_temp_dc()
        .ok_or("maximum battery temperature has not been reported")?;

    if min_temp < MIN_TEMP_FLOOR_DC {
        return Err("battery is too cold");
    }
    if max_temp > MAX_TEMP_CEIL_DC {
        return Err("battery is too hot");
    }
    if min_temp > max_temp {
        return Err("battery min temp is higher than max temp");
    }
    if max_temp - min_temp >= MAX_TEMP_SPREAD_DC {
        return Err("battery temperature difference is too high");
    }

    let min_cell = pack.min_cell_mv();
    let max_cell = pack.max_cell_mv();
    if min_cell == 0 {
        return Err("minimum cell voltage has not been reported");
    }
    if max_cell == 0 {
        return Err("maximum cell voltage has not been reported");
    }
    if min_cell > max_cell {
        return Err("battery min cell voltage is higher than max cell voltage");
    }
    if max_cell - min_cell >= config.dev_cell_voltage_mv {
        return Err("battery cell voltage difference is too high");
    }

    Ok(())
}

/// `(limit_W * 100) / voltage_dV`, zero if `token` is not safe or voltage
/// is unknown, where `limit_W = min(manufacturer_W, config_W)`.
fn safety_limited_da(safety: &Safety, token: u32, manufacturer_w: u32, config_w: u32, voltage_dv: Option<u32>) -> u32 {
    if !safety.issafe(token) {
        return 0;
    }
    let voltage_dv = match voltage_dv {
        Some(v) if v != 0 => v,
        _ => return 0,
    };
    let limit_w = manufacturer_w.min(config_w);
    (limit_w as u64 * 100 / voltage_dv as u64) as u32
}

/// Maximum permitted charge current, zeroed if the max cell voltage has
/// climbed past the configured ceiling (§4.D).
pub fn charge_da(safety: &Safety, token: u32, pack: &PackState, config: &BatteryConfig) -> u32 {
    let da = safety_limited_da(
        safety,
        token,
        pack.manufacturer_charge_w().unwrap_or(0),
        config.charge_w,
        pack.voltage_dv(),
    );
    if pack.max_cell_mv() > config.max_cell_voltage_mv {
        0
    } else {
        da
    }
}

/// Maximum permitted discharge current, zeroed if the min cell voltage has
/// dropped below the configured floor (§4.D).
pub fn discharge_da(safety: &Safety, token: u32, pack: &PackState, config: &BatteryConfig) -> u32 {
    let da = safety_limited_da(
        safety,
        token,
        pack.manufacturer_discharge_w().unwrap_or(0),
        config.discharge_w,
        pack.voltage_dv(),
    );
    if pack.min_cell_mv() < config.min_cell_voltage_mv {
        0
    } else {
        da
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatteryProtocol;

    fn test_config() -> BatteryConfig {
        BatteryConfig {
            protocol: BatteryProtocol::Byd,
            ifname: "can0".to_string(),
            rated_capacity_ah: 150,
            rated_voltage_dv: 4032,
            rated_capacity_wh: 0,
            min_voltage_dv: 2800,
            max_voltage_dv: 3800,
            ncells: 126,
            min_cell_voltage_mv: 2800,
            max_cell_voltage_mv: 3800,
            dev_cell_voltage_mv: 150,
            charge_w: 5000,
            discharge_w: 5000,
        }
    }

    fn safe_pack() -> PackState {
        let mut p = PackState::new();
        p.set_running();
        p.set_min_temp_dc(100);
        p.set_max_temp_dc(200);
        p.set_min_cell_mv(3200);
        p.set_max_cell_mv(3250);
        p.set_voltage_dv(4000);
        p.set_manufacturer_charge_w(3000);
        p.set_manufacturer_discharge_w(3000);
        p
    }

    #[test]
    fn issafe_aborts_on_garbage_token() {
        let safety = Safety::new();
        let garbage = safety
            .safe_token()
            .wrapping_add(safety.unsafe_token())
            .wrapping_add(1);
        // Extremely unlikely to collide with either sentinel; if it does,
        // the test is not meaningful, so just skip.
        if garbage == safety.safe_token() || garbage == safety.unsafe_token() {
            return;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| safety.issafe(garbage)));
        assert!(result.is_err());
    }

    #[test]
    fn not_running_is_always_unsafe() {
        let mut safety = Safety::new();
        let config = test_config();
        let mut pack = safe_pack();
        pack.set_stopped();
        let token = safety.evaluate(&pack, &config);
        assert_eq!(token, safety.unsafe_token());
    }

    #[test]
    fn fully_populated_in_range_pack_is_safe() {
        let mut safety = Safety::new();
        let config = test_config();
        let pack = safe_pack();
        let token = safety.evaluate(&pack, &config);
        assert_eq!(token, safety.safe_token());
    }

    #[test]
    fn charge_da_zeroed_when_max_cell_exceeds_config_limit() {
        let mut safety = Safety::new();
        let mut config = test_config();
        config.max_cell_voltage_mv = 3240; // below pack's reported 3250
        let pack = safe_pack();
        let token = safety.evaluate(&pack, &config);
        assert_eq!(charge_da(&safety, token, &pack, &config), 0);
        // discharge is unaffected by the charge-side limit
        assert!(discharge_da(&safety, token, &pack, &config) > 0);
    }

    #[test]
    fn discharge_da_zeroed_when_min_cell_below_config_limit() {
        let mut safety = Safety::new();
        let mut config = test_config();
        config.min_cell_voltage_mv = 3210; // above pack's reported 3200
        let pack = safe_pack();
        let token = safety.evaluate(&pack, &config);
        assert_eq!(discharge_da(&safety, token, &pack, &config), 0);
        assert!(charge_da(&safety, token, &pack, &config) > 0);
    }

    #[test]
    fn envelope_matches_closed_form() {
        let mut safety = Safety::new();
        let config = test_config();
        let pack = safe_pack();
        let token = safety.evaluate(&pack, &config);
        let expected = (3000u64.min(5000) * 100 / 4000) as u32;
        assert_eq!(charge_da(&safety, token, &pack, &config), expected);
    }
}
