// MG4 battery driver: 100 ms keep-alive, 10 ms contactor-close sequence,
// and decoders for the status (0x12C) and SoC (0x401) broadcasts. Pack
// temperature and cell-voltage bounds are reported once at attach time as
// static placeholders since the observed MG4 traffic carries no per-cell
// telemetry (see examples/original_source/battery/b_mg4.c).

use super::BatteryDriver;
use crate::can::Frame;
use crate::config::BatteryConfig;
use crate::error::GatewayError;
use crate::kv::{Kv, KvSink, KvType};
use crate::pack::PackState;

const RATED_CAPACITY_AH: u32 = 156;
const RATED_VOLTAGE_DV: u32 = 3270;
const PACK_MIN_VOLTAGE_DV: u32 = 2800;
const PACK_MAX_VOLTAGE_DV: u32 = 3590;
const MANUFACTURER_CHARGE_W: u32 = 5000;
const MANUFACTURER_DISCHARGE_W: u32 = 5000;
const STATIC_MIN_TEMP_DC: i32 = 290;
const STATIC_MAX_TEMP_DC: i32 = 310;
const STATIC_AVG_TEMP_DC: i32 = 300;
const STATIC_MIN_CELL_MV: u32 = 2999;
const STATIC_MAX_CELL_MV: u32 = 3001;

const CONTACTOR_SEQUENCE: [u64; 14] = [
    0x8100_457D_7FFE_FFFE,
    0xDC01_457D_7FFE_FFFE,
    0xB402_457D_7FFF_FFFE,
    0xE903_457D_7FFF_FFFE,
    0xE804_457D_7FFE_FFFE,
    0xB505_457D_7FFE_FFFE,
    0xDD06_457D_7FFF_FFFE,
    0x0F07_457D_7FFE_FFFE,
    0x5308_457D_7FFE_FFFE,
    0x8109_457D_7FFF_FFFE,
    0x660A_457D_7FFF_FFFE,
    0xB40B_457D_7FFE_FFFE,
    0x3A0C_457D_7FFE_FFFE,
    0x0F0E_457D_7FFF_FFFE,
];

const KV_SOC: usize = 0;
const KV_VOLTAGE: usize = 1;
const KV_CURRENT: usize = 2;
const KV_POWER: usize = 3;
const KV_COUNT: usize = 4;

fn kv_table() -> [Kv; KV_COUNT] {
    [
        Kv::new("soc", KvType::Percent, 1),
        Kv::new("", KvType::Voltage, 1),
        Kv::new("", KvType::Current, 1),
        Kv::new("", KvType::Power, 0),
    ]
}

pub struct Mg4 {
    contactor_idx: usize,
    kvs: [Kv; KV_COUNT],
}

impl BatteryDriver for Mg4 {
    fn check(config: &BatteryConfig) -> Result<(), GatewayError> {
        if config.min_cell_voltage_mv != 0 || config.max_cell_voltage_mv != 0 {
            return Err(GatewayError::config(
                "battery",
                "mg4: cell-voltage bounds are reported constants, do not set them",
            ));
        }
        Ok(())
    }

    fn apply_defaults(config: &mut BatteryConfig) {
        if config.rated_capacity_ah == 0 {
            config.rated_capacity_ah = RATED_CAPACITY_AH;
        }
        if config.rated_voltage_dv == 0 {
            config.rated_voltage_dv = RATED_VOLTAGE_DV;
        }
        config.min_cell_voltage_mv = STATIC_MIN_CELL_MV;
        config.max_cell_voltage_mv = STATIC_MAX_CELL_MV;
    }

    fn attach(_config: &BatteryConfig) -> Self {
        Mg4 {
            contactor_idx: 0,
            kvs: kv_table(),
        }
    }

    fn dispatch(&mut self, config: &BatteryConfig, pack: &mut PackState) -> Vec<Frame> {
        pack.set_rated_capacity_ah(config.rated_capacity_ah);
        pack.set_rated_voltage_dv(config.rated_voltage_dv);
        pack.set_min_voltage_dv(PACK_MIN_VOLTAGE_DV);
        pack.set_max_voltage_dv(PACK_MAX_VOLTAGE_DV);
        pack.set_manufacturer_charge_w(MANUFACTURER_CHARGE_W);
        pack.set_manufacturer_discharge_w(MANUFACTURER_DISCHARGE_W);
        pack.set_min_temp_dc(STATIC_MIN_TEMP_DC);
        pack.set_max_temp_dc(STATIC_MAX_TEMP_DC);
        pack.set_avg_temp_dc(STATIC_AVG_TEMP_DC);
        pack.set_min_cell_mv(STATIC_MIN_CELL_MV);
        pack.set_max_cell_mv(STATIC_MAX_CELL_MV);

        vec![self.tick_keepalive(), self.tick_contactor()]
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        pack: &mut PackState,
        sink: &mut dyn KvSink,
        prefix: &str,
        now: u64,
    ) -> (Vec<Frame>, bool) {
        let recognized = frame.id == 0x12C;
        if recognized {
            pack.set_running();
        }

        match frame.id {
            0x12C => {
                let sv = (frame.be16(2) as i32 - 20000) / 2;
                pack.set_current_da(-sv);
                self.kvs[KV_CURRENT].update(sink, prefix, "battery", now, sv);

                let uv = (frame.be16(4) as u32 * 5) >> 5;
                pack.set_voltage_dv(uv);
                self.kvs[KV_VOLTAGE].update(sink, prefix, "battery", now, uv as i32);

                self.kvs[KV_POWER].update(sink, prefix, "battery", now, uv as i32 * sv);
            }
            0x401 => {
                if frame.data[2] & 1 == 0 {
                    let uv = frame.be16(6) & 0x3ff;
                    pack.set_soc_cpct(uv as u32 * 10);
                    self.kvs[KV_SOC].update(sink, prefix, "battery", now, uv as i32);
                }
            }
            _ => {}
        }

        (Vec::new(), recognized)
    }

    fn teleperiod(&self, prefix: &str, sink: &mut dyn KvSink) {
        for kv in &self.kvs {
            kv.sweep(sink, prefix, "battery");
        }
    }
}

impl Mg4 {
    pub fn tick_keepalive(&self) -> Frame {
        Frame::new(0x4F3, [0xf3, 0x10, 0x48, 0x00, 0xff, 0xff, 0x00, 0x11])
    }

    pub fn tick_contactor(&mut self) -> Frame {
        let value = CONTACTOR_SEQUENCE[self.contactor_idx];
        self.contactor_idx = (self.contactor_idx + 1) % CONTACTOR_SEQUENCE.len();
        Frame::new(0x047, value.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BatteryConfig, BatteryProtocol};

    struct NullSink;
    impl KvSink for NullSink {
        fn publish(&mut self, _topic: &str, _payload: &str) {}
    }

    fn config() -> BatteryConfig {
        let mut c = BatteryConfig {
            protocol: BatteryProtocol::Mg4,
            ifname: "can0".to_string(),
            rated_capacity_ah: 0,
            rated_voltage_dv: 0,
            rated_capacity_wh: 0,
            min_voltage_dv: 0,
            max_voltage_dv: 0,
            ncells: 0,
            min_cell_voltage_mv: 0,
            max_cell_voltage_mv: 0,
            dev_cell_voltage_mv: 0,
            charge_w: 5000,
            discharge_w: 5000,
        };
        Mg4::apply_defaults(&mut c);
        c
    }

    #[test]
    fn s5_status_frame_decodes_current_and_voltage() {
        let config = config();
        let mut mg4 = Mg4::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let frame = Frame::new(0x12C, [0x00, 0x00, 0x4E, 0x20, 0x00, 0xC8, 0x00, 0x00]);
        let (_, recognized) = mg4.handle_frame(&frame, &mut pack, &mut sink, "bg", 0);
        assert!(recognized);
        assert_eq!(pack.current_da(), Some(0));
        assert_eq!(pack.voltage_dv(), Some(31));
    }

    #[test]
    fn soc_ignored_when_low_bit_of_byte2_set() {
        let config = config();
        let mut mg4 = Mg4::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let frame = Frame::new(0x401, [0, 0, 0x01, 0, 0, 0, 0x01, 0x2c]);
        mg4.handle_frame(&frame, &mut pack, &mut sink, "bg", 0);
        assert_eq!(pack.soc_cpct(), None);
    }

    #[test]
    fn soc_decoded_when_low_bit_of_byte2_clear() {
        let config = config();
        let mut mg4 = Mg4::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let frame = Frame::new(0x401, [0, 0, 0x00, 0, 0, 0, 0x01, 0x2c]);
        mg4.handle_frame(&frame, &mut pack, &mut sink, "bg", 0);
        assert_eq!(pack.soc_cpct(), Some(3000));
    }

    #[test]
    fn contactor_sequence_cycles() {
        let config = config();
        let mut mg4 = Mg4::attach(&config);
        let first = mg4.tick_contactor();
        for _ in 1..CONTACTOR_SEQUENCE.len() {
            mg4.tick_contactor();
        }
        let wrapped = mg4.tick_contactor();
        assert_eq!(first, wrapped);
    }

    #[test]
    fn contactor_sequence_matches_reference_handshake_bytes() {
        let config = config();
        let mut mg4 = Mg4::attach(&config);
        let first = mg4.tick_contactor();
        assert_eq!(first.id, 0x047);
        assert_eq!(first.data, 0x8100_457D_7FFE_FFFEu64.to_be_bytes());

        for _ in 1..CONTACTOR_SEQUENCE.len() - 1 {
            mg4.tick_contactor();
        }
        let last = mg4.tick_contactor();
        assert_eq!(last.data, 0x0F0E_457D_7FFF_FFFEu64.to_be_bytes());
    }

    #[test]
    fn keepalive_frame_is_constant() {
        let config = config();
        let mg4 = Mg4::attach(&config);
        let f = mg4.tick_keepalive();
        assert_eq!(f.id, 0x4F3);
        assert_eq!(f.data, [0xf3, 0x10, 0x48, 0x00, 0xff, 0xff, 0x00, 0x11]);
    }
}
