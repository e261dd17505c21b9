// Pack-state aggregate: the only mutable, validity-tracked view of the
// storage pack shared between the battery driver (writer), the inverter
// driver and the safety supervisor (readers).

use bitflags::bitflags;

bitflags! {
    /// Validity bits for the six measured fields. Rated fields and the
    /// voltage envelope use non-zero-as-present instead (see accessors
    /// below) rather than a bit each, matching the reference design.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Valid: u8 {
        const SOC      = 1 << 0;
        const VOLTAGE  = 1 << 1;
        const CURRENT  = 1 << 2;
        const MIN_TEMP = 1 << 3;
        const MAX_TEMP = 1 << 4;
        const AVG_TEMP = 1 << 5;
    }
}

/// Aggregate battery-pack state. Setters are the only mutators; accessors
/// return present/absent rather than a raw value, per §4.C.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackState {
    running: bool,

    rated_capacity_ah: u32,
    rated_voltage_dv: u32,
    rated_capacity_wh: u32,

    min_voltage_dv: u32,
    max_voltage_dv: u32,

    manufacturer_charge_w: u32,
    manufacturer_discharge_w: u32,

    min_cell_mv: u32,
    max_cell_mv: u32,

    soc_cpct: u32,
    voltage_dv: u32,
    current_da: i32,
    min_temp_dc: i32,
    max_temp_dc: i32,
    avg_temp_dc: i32,

    valid: Valid,
}

impl PackState {
    pub fn new() -> Self {
        Self::default()
    }

    // -- liveness -----------------------------------------------------

    pub fn set_running(&mut self) {
        self.running = true;
    }

    pub fn set_stopped(&mut self) {
        self.running = false;
    }

    pub fn running(&self) -> bool {
        self.running
    }

    // -- rated / envelope / manufacturer limits (non-zero = present) --

    pub fn set_rated_capacity_ah(&mut self, v: u32) {
        self.rated_capacity_ah = v;
    }

    pub fn set_rated_voltage_dv(&mut self, v: u32) {
        self.rated_voltage_dv = v;
    }

    pub fn set_rated_capacity_wh(&mut self, v: u32) {
        self.rated_capacity_wh = v;
    }

    pub fn set_min_voltage_dv(&mut self, v: u32) {
        self.min_voltage_dv = v;
    }

    /// Fixed relative to the reference implementation, where this setter
    /// (and its paired getter) wrote to the min-voltage field instead of
    /// max — see DESIGN.md open question (ii).
    pub fn set_max_voltage_dv(&mut self, v: u32) {
        self.max_voltage_dv = v;
    }

    pub fn set_manufacturer_charge_w(&mut self, v: u32) {
        self.manufacturer_charge_w = v;
    }

    pub fn set_manufacturer_discharge_w(&mut self, v: u32) {
        self.manufacturer_discharge_w = v;
    }

    pub fn set_min_cell_mv(&mut self, v: u32) {
        self.min_cell_mv = v;
    }

    pub fn set_max_cell_mv(&mut self, v: u32) {
        self.max_cell_mv = v;
    }

    pub fn rated_capacity_ah(&self) -> Option<u32> {
        (self.rated_capacity_ah != 0).then_some(self.rated_capacity_ah)
    }

    /// Stored if provided, else derived as `rated_Ah * rated_voltage_dV / 10`
    /// when both are non-zero.
    pub fn rated_capacity_wh(&self) -> Option<u32> {
        if self.rated_capacity_wh != 0 {
            return Some(self.rated_capacity_wh);
        }
        if self.rated_capacity_ah != 0 && self.rated_voltage_dv != 0 {
            return Some(self.rated_capacity_ah * self.rated_voltage_dv / 10);
        }
        None
    }

    pub fn min_voltage_dv(&self) -> Option<u32> {
        (self.min_voltage_dv != 0).then_some(self.min_voltage_dv)
    }

    pub fn max_voltage_dv(&self) -> Option<u32> {
        (self.max_voltage_dv != 0).then_some(self.max_voltage_dv)
    }

    pub fn manufacturer_charge_w(&self) -> Option<u32> {
        (self.manufacturer_charge_w != 0).then_some(self.manufacturer_charge_w)
    }

    pub fn manufacturer_discharge_w(&self) -> Option<u32> {
        (self.manufacturer_discharge_w != 0).then_some(self.manufacturer_discharge_w)
    }

    pub fn min_cell_mv(&self) -> u32 {
        self.min_cell_mv
    }

    pub fn max_cell_mv(&self) -> u32 {
        self.max_cell_mv
    }

    // -- measured fields (validity bit = present) ----------------------

    pub fn set_soc_cpct(&mut self, v: u32) {
        self.soc_cpct = v;
        self.valid.insert(Valid::SOC);
    }

    pub fn set_voltage_dv(&mut self, v: u32) {
        self.voltage_dv = v;
        self.valid.insert(Valid::VOLTAGE);
    }

    pub fn set_current_da(&mut self, v: i32) {
        self.current_da = v;
        self.valid.insert(Valid::CURRENT);
    }

    pub fn set_min_temp_dc(&mut self, v: i32) {
        self.min_temp_dc = v;
        self.valid.insert(Valid::MIN_TEMP);
    }

    pub fn set_max_temp_dc(&mut self, v: i32) {
        self.max_temp_dc = v;
        self.valid.insert(Valid::MAX_TEMP);
    }

    pub fn set_avg_temp_dc(&mut self, v: i32) {
        self.avg_temp_dc = v;
        self.valid.insert(Valid::AVG_TEMP);
    }

    pub fn soc_cpct(&self) -> Option<u32> {
        self.valid.contains(Valid::SOC).then_some(self.soc_cpct)
    }

    pub fn voltage_dv(&self) -> Option<u32> {
        self.valid.contains(Valid::VOLTAGE).then_some(self.voltage_dv)
    }

    pub fn current_da(&self) -> Option<i32> {
        self.valid.contains(Valid::CURRENT).then_some(self.current_da)
    }

    pub fn min_temp_dc(&self) -> Option<i32> {
        self.valid.contains(Valid::MIN_TEMP).then_some(self.min_temp_dc)
    }

    pub fn max_temp_dc(&self) -> Option<i32> {
        self.valid.contains(Valid::MAX_TEMP).then_some(self.max_temp_dc)
    }

    /// Present iff its own bit is set; else derived as the midpoint of
    /// min/max when both are present; else absent.
    pub fn avg_temp_dc(&self) -> Option<i32> {
        if self.valid.contains(Valid::AVG_TEMP) {
            return Some(self.avg_temp_dc);
        }
        match (self.min_temp_dc(), self.max_temp_dc()) {
            (Some(min), Some(max)) => Some(min + (max - min) / 2),
            _ => None,
        }
    }

    pub fn remaining_capacity_ah(&self) -> Option<u32> {
        match (self.rated_capacity_ah(), self.soc_cpct()) {
            (Some(ah), Some(soc)) => Some((ah as u64 * soc as u64 / 10_000) as u32),
            _ => None,
        }
    }
}

/// Inverter-side state: liveness and inferred contactor position.
#[derive(Debug, Clone, Copy, Default)]
pub struct InverterState {
    running: bool,
    contactor_closed: bool,
}

impl InverterState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&mut self) {
        self.running = true;
    }

    pub fn set_stopped(&mut self) {
        self.running = false;
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn set_contactor(&mut self, closed: bool) {
        self.contactor_closed = closed;
    }

    pub fn contactor_closed(&self) -> bool {
        self.contactor_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setter_accessor_roundtrip() {
        let mut p = PackState::new();
        assert_eq!(p.soc_cpct(), None);
        p.set_soc_cpct(4321);
        assert_eq!(p.soc_cpct(), Some(4321));

        p.set_voltage_dv(4276);
        assert_eq!(p.voltage_dv(), Some(4276));

        p.set_current_da(-50);
        assert_eq!(p.current_da(), Some(-50));
    }

    #[test]
    fn avg_temp_derived_from_min_max_when_unset() {
        let mut p = PackState::new();
        assert_eq!(p.avg_temp_dc(), None);
        p.set_min_temp_dc(100);
        assert_eq!(p.avg_temp_dc(), None, "only min present");
        p.set_max_temp_dc(200);
        assert_eq!(p.avg_temp_dc(), Some(150));
    }

    #[test]
    fn avg_temp_explicit_bit_wins_over_derivation() {
        let mut p = PackState::new();
        p.set_min_temp_dc(100);
        p.set_max_temp_dc(200);
        p.set_avg_temp_dc(999);
        assert_eq!(p.avg_temp_dc(), Some(999));
    }

    #[test]
    fn rated_capacity_wh_derived_when_absent() {
        let mut p = PackState::new();
        assert_eq!(p.rated_capacity_wh(), None);
        p.set_rated_capacity_ah(150);
        p.set_rated_voltage_dv(4032);
        assert_eq!(p.rated_capacity_wh(), Some(150 * 4032 / 10));

        p.set_rated_capacity_wh(12345);
        assert_eq!(p.rated_capacity_wh(), Some(12345), "stored value wins");
    }

    #[test]
    fn max_voltage_setter_writes_max_not_min() {
        let mut p = PackState::new();
        p.set_min_voltage_dv(2800);
        p.set_max_voltage_dv(3800);
        assert_eq!(p.min_voltage_dv(), Some(2800));
        assert_eq!(p.max_voltage_dv(), Some(3800));
    }
}
