// BYD battery driver: poll/response PID cycle, 50 ms/100 ms periodic
// keep-alive frames, and the broadcast decoders for pack voltage, SoC,
// per-module temperatures and per-cell voltages. Grounded on
// examples/original_source/battery/b_byd.c.

use super::BatteryDriver;
use crate::can::Frame;
use crate::config::BatteryConfig;
use crate::error::GatewayError;
use crate::kv::{Kv, KvSink, KvType};
use crate::pack::PackState;

const MIN_CELL_VOLTAGE_MV: u32 = 2800;
const MAX_CELL_VOLTAGE_MV: u32 = 3800;
const DEV_CELL_VOLTAGE_MV: u32 = 150;
const RATED_CAPACITY_AH: u32 = 150;
const RATED_VOLTAGE_DV: u32 = 4032;
const NCELLS: u32 = 126;

const PACK_MIN_VOLTAGE_DV: u32 = 3800;
const PACK_MAX_VOLTAGE_DV: u32 = 4410;

const PIDS: [u16; 15] = [
    0x0005, 0x0008, 0x0009, 0x002F, 0x0031, 0x0032, 0x002B, 0x002D, 0x000A, 0x000E, 0x000B,
    0x000F, 0x0010, 0x0011, 0x0012,
];

/// ~1.15 s at a 50 ms tick: the one-shot switch to the second `0x12D`
/// payload pattern.
const CHANGE_TICKS: u32 = 23;

const KV_AMBIENT: usize = 0;
const KV_VOLTAGE: usize = 1;
const KV_SOC: usize = 2;
const KV_PID_SOC: usize = 3;
const KV_PID_VOLTAGE: usize = 4;
const KV_PID_CURRENT: usize = 5;
const KV_TEMP_MIN: usize = 6;
const KV_TEMP_MAX: usize = 7;
const KV_TEMP_AVG: usize = 8;
const KV_CELL_MV_MIN: usize = 9;
const KV_CELL_MV_MAX: usize = 10;
const KV_CELL_MV_DELTA: usize = 11;
const KV_MAX_CHARGE_W: usize = 12;
const KV_MAX_DISCHARGE_W: usize = 13;
const KV_CHARGE_COUNT: usize = 14;
const KV_CHARGED_AH: usize = 15;
const KV_DISCHARGED_AH: usize = 16;
const KV_CHARGED_KWH: usize = 17;
const KV_DISCHARGED_KWH: usize = 18;
const KV_COUNT: usize = 19;

fn kv_table() -> [Kv; KV_COUNT] {
    [
        Kv::new("ambient", KvType::Temperature, 0),
        Kv::new("", KvType::Voltage, 1),
        Kv::new("soc", KvType::Percent, 1),
        Kv::new("pid-soc", KvType::Percent, 0),
        Kv::new("pid-voltage", KvType::Voltage, 0),
        Kv::new("pid-current", KvType::Current, 0),
        Kv::new("min", KvType::Temperature, 0),
        Kv::new("max", KvType::Temperature, 0),
        Kv::new("avg", KvType::Temperature, 0),
        Kv::new("cell-min", KvType::Voltage, 3),
        Kv::new("cell-max", KvType::Voltage, 3),
        Kv::new("cell-delta", KvType::Voltage, 3),
        Kv::new("max-charge", KvType::Power, 0),
        Kv::new("max-discharge", KvType::Power, 0),
        Kv::new("charge-count", KvType::Count, 0),
        Kv::new("charged", KvType::AmpHour, 0),
        Kv::new("discharged", KvType::AmpHour, 0),
        Kv::new("charged", KvType::Energy, 0),
        Kv::new("discharged", KvType::Energy, 0),
    ]
}

pub struct Byd {
    poll_idx: usize,
    nonce_hi: u8,
    nonce_lo: u8,
    tick50_count: u32,
    kvs: [Kv; KV_COUNT],
    pack_temps: [Kv; 10],
    cells: Vec<Kv>,
}

impl BatteryDriver for Byd {
    fn check(config: &BatteryConfig) -> Result<(), GatewayError> {
        if config.min_cell_voltage_mv != 0
            || config.max_cell_voltage_mv != 0
            || config.dev_cell_voltage_mv != 0
            || config.ncells != 0
        {
            return Err(GatewayError::config(
                "battery",
                "byd: cell-voltage bounds and ncells are manufacturer constants, do not set them",
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
        config.ncells = NCELLS;
        config.min_cell_voltage_mv = MIN_CELL_VOLTAGE_MV;
        config.max_cell_voltage_mv = MAX_CELL_VOLTAGE_MV;
        config.dev_cell_voltage_mv = DEV_CELL_VOLTAGE_MV;
    }

    fn attach(config: &BatteryConfig) -> Self {
        let ncells = config.ncells.max(NCELLS) as usize;
        Byd {
            poll_idx: 0,
            nonce_hi: 0xbf,
            nonce_lo: 0x59,
            tick50_count: 0,
            kvs: kv_table(),
            pack_temps: std::array::from_fn(|_| Kv::new("", KvType::Temperature, 0)),
            cells: (0..ncells).map(|_| Kv::new("", KvType::Voltage, 3)).collect(),
        }
    }

    fn dispatch(&mut self, config: &BatteryConfig, pack: &mut PackState) -> Vec<Frame> {
        pack.set_rated_capacity_ah(config.rated_capacity_ah);
        pack.set_rated_voltage_dv(config.rated_voltage_dv);
        pack.set_min_voltage_dv(PACK_MIN_VOLTAGE_DV);
        pack.set_max_voltage_dv(PACK_MAX_VOLTAGE_DV);

        vec![self.tick_50ms(), self.tick_100ms(false), self.poll_tick()]
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        pack: &mut PackState,
        sink: &mut dyn KvSink,
        prefix: &str,
        now: u64,
    ) -> (Vec<Frame>, bool) {
        let recognized = matches!(
            frame.id,
            0x244 | 0x245 | 0x286 | 0x344 | 0x345 | 0x347 | 0x34A | 0x35E | 0x360 | 0x36C
                | 0x438 | 0x43A | 0x43B | 0x43C | 0x43D | 0x444 | 0x445 | 0x446 | 0x447 | 0x47B
                | 0x524
        );
        if recognized {
            pack.set_running();
        }

        let mut replies = Vec::new();
        match frame.id {
            0x245 => {
                if frame.data[0] == 0x01 {
                    let ambient = frame.data[4] as i32 - 40;
                    self.kvs[KV_AMBIENT].update(sink, prefix, "battery", now, ambient);
                }
            }
            0x43C => {
                let base = frame.data[0] as usize * 6;
                for i in 0..6 {
                    let key = base + i;
                    if key < self.pack_temps.len() {
                        let t = frame.data[1 + i] as i32 - 40;
                        self.pack_temps[key].update(sink, prefix, "battery", now, t);
                    }
                }
            }
            0x43D => {
                let base = frame.data[0] as usize * 3;
                for i in 0..3 {
                    let key = base + i;
                    if key < self.cells.len() {
                        let mv = frame.le16(1 + i * 2);
                        self.cells[key].update(sink, prefix, "battery", now, mv as i32);
                    }
                }
            }
            0x444 => {
                let v = frame.le16(0);
                pack.set_voltage_dv(v as u32);
                self.kvs[KV_VOLTAGE].update(sink, prefix, "battery", now, v as i32);
            }
            0x447 => {
                let v = frame.le16(4);
                pack.set_soc_cpct(v as u32 * 10);
                self.kvs[KV_SOC].update(sink, prefix, "battery", now, v as i32);
            }
            0x7EF => {
                if frame.data[0] == 0x10 {
                    replies.push(Frame::new(0x7E7, [0x30, 0x08, 0x05, 0, 0, 0, 0, 0]));
                }
                self.decode_pid_response(frame, pack, sink, prefix, now);
            }
            _ => {}
        }

        (replies, recognized)
    }

    fn teleperiod(&self, prefix: &str, sink: &mut dyn KvSink) {
        for kv in &self.kvs {
            kv.sweep(sink, prefix, "battery");
        }
        for kv in &self.pack_temps {
            kv.sweep(sink, prefix, "battery");
        }
        for kv in &self.cells {
            kv.sweep(sink, prefix, "battery");
        }
    }
}

impl Byd {
    fn decode_pid_response(
        &mut self,
        frame: &Frame,
        pack: &mut PackState,
        sink: &mut dyn KvSink,
        prefix: &str,
        now: u64,
    ) {
        let pid = frame.be16(2);
        match pid {
            0x0005 => {
                self.kvs[KV_PID_SOC].update(sink, prefix, "battery", now, frame.data[4] as i32);
            }
            0x0008 => {
                let dv = frame.le16(4);
                pack.set_voltage_dv(dv as u32);
                self.kvs[KV_PID_VOLTAGE].update(sink, prefix, "battery", now, dv as i32);
            }
            0x0009 => {
                let sv = frame.le16(4) as i32 - 5000;
                self.kvs[KV_PID_CURRENT].update(sink, prefix, "battery", now, sv);
            }
            0x002F => {
                let c = frame.data[4] as i32 - 40;
                pack.set_min_temp_dc(c * 10);
                self.kvs[KV_TEMP_MIN].update(sink, prefix, "battery", now, c);
            }
            0x0031 => {
                let c = frame.data[4] as i32 - 40;
                pack.set_max_temp_dc(c * 10);
                self.kvs[KV_TEMP_MAX].update(sink, prefix, "battery", now, c);
            }
            0x0032 => {
                let c = frame.data[4] as i32 - 40;
                pack.set_avg_temp_dc(c * 10);
                self.kvs[KV_TEMP_AVG].update(sink, prefix, "battery", now, c);
            }
            0x002B => {
                let mv = frame.le16(4);
                pack.set_min_cell_mv(mv as u32);
                self.kvs[KV_CELL_MV_MIN].update(sink, prefix, "battery", now, mv as i32);
            }
            0x002D => {
                let mv = frame.le16(4);
                pack.set_max_cell_mv(mv as u32);
                self.kvs[KV_CELL_MV_MAX].update(sink, prefix, "battery", now, mv as i32);
                if let Some(min_mv) = self.kvs[KV_CELL_MV_MIN].get() {
                    let delta = mv as i32 - min_mv;
                    if delta >= 0 {
                        self.kvs[KV_CELL_MV_DELTA].update(sink, prefix, "battery", now, delta);
                    }
                }
            }
            0x000A => {
                let w = frame.le16(4) as u32 * 100;
                pack.set_manufacturer_charge_w(w);
                self.kvs[KV_MAX_CHARGE_W].update(sink, prefix, "battery", now, w as i32);
            }
            0x000E => {
                let w = frame.le16(4) as u32 * 100;
                pack.set_manufacturer_discharge_w(w);
                self.kvs[KV_MAX_DISCHARGE_W].update(sink, prefix, "battery", now, w as i32);
            }
            0x000B => {
                self.kvs[KV_CHARGE_COUNT].update(sink, prefix, "battery", now, frame.le16(4) as i32);
            }
            0x000F => {
                self.kvs[KV_CHARGED_AH].update(sink, prefix, "battery", now, frame.le16(4) as i32);
            }
            0x0010 => {
                self.kvs[KV_DISCHARGED_AH].update(sink, prefix, "battery", now, frame.le16(4) as i32);
            }
            0x0011 => {
                self.kvs[KV_CHARGED_KWH].update(sink, prefix, "battery", now, frame.le16(4) as i32);
            }
            0x0012 => {
                self.kvs[KV_DISCHARGED_KWH].update(sink, prefix, "battery", now, frame.le16(4) as i32);
            }
            _ => {}
        }
    }

    pub fn poll_tick(&mut self) -> Frame {
        let pid = PIDS[self.poll_idx];
        self.poll_idx = (self.poll_idx + 1) % PIDS.len();
        Frame::new(
            0x7E7,
            [0x03, 0x22, (pid >> 8) as u8, (pid & 0xff) as u8, 0, 0, 0, 0],
        )
    }

    pub fn tick_50ms(&mut self) -> Frame {
        self.tick50_count = self.tick50_count.saturating_add(1);
        let mut data = [0xa0, 0x28, 0x02, 0xa0, 0x0c, 0x71, 0, 0];
        if self.tick50_count > CHANGE_TICKS {
            data[2] = 0x00;
            data[3] = 0x22;
            data[5] = 0x31;
        }
        self.nonce_hi = self.nonce_hi.wrapping_sub(0x10);
        self.nonce_lo = self.nonce_lo.wrapping_sub(0x10);
        data[6] = self.nonce_hi;
        data[7] = self.nonce_lo;
        Frame::new(0x12D, data)
    }

    pub fn tick_100ms(&mut self, contactor_closed: bool) -> Frame {
        let mut data = [0x98, 0x3a, 0x88, 0x13, 0, 0, 0xff, 0x00];
        let mut v = self.kvs[KV_VOLTAGE].get().unwrap_or(0);
        if v <= 12 || !contactor_closed {
            v = 12;
        }
        let v = v as u16;
        data[4] = (v & 0xff) as u8;
        data[5] = (v >> 8) as u8;
        let mut csum: u32 = 0;
        for b in &data[0..7] {
            csum += *b as u32;
        }
        data[7] = !(csum as u8);
        Frame::new(0x441, data)
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
            protocol: BatteryProtocol::Byd,
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
        Byd::apply_defaults(&mut c);
        c
    }

    #[test]
    fn s1_pack_voltage_from_0x444() {
        let config = config();
        let mut byd = Byd::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let frame = Frame::new(0x444, [0xb4, 0x10, 0, 0, 0, 0, 0, 0]);
        byd.handle_frame(&frame, &mut pack, &mut sink, "bg", 0);
        assert_eq!(pack.voltage_dv(), Some(4276));
        assert_eq!(Kv::format(byd.kvs[KV_VOLTAGE].get().unwrap(), 1), "427.6");
    }

    #[test]
    fn s2_soc_from_0x447() {
        let config = config();
        let mut byd = Byd::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let frame = Frame::new(0x447, [0, 0, 0, 0, 0x2c, 0x01, 0, 0]);
        byd.handle_frame(&frame, &mut pack, &mut sink, "bg", 0);
        assert_eq!(pack.soc_cpct(), Some(3000));
    }

    #[test]
    fn s3_cell_triple_from_0x43d() {
        let config = config();
        let mut byd = Byd::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let frame = Frame::new(0x43D, [0x02, 0x20, 0x0D, 0x21, 0x0D, 0x22, 0x0D, 0]);
        byd.handle_frame(&frame, &mut pack, &mut sink, "bg", 0);
        assert_eq!(byd.cells[6].get(), Some(0x0D20));
        assert_eq!(byd.cells[7].get(), Some(0x0D21));
        assert_eq!(byd.cells[8].get(), Some(0x0D22));
    }

    #[test]
    fn pid_voltage_writes_pack_state() {
        let config = config();
        let mut byd = Byd::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let frame = Frame::new(0x7EF, [0, 0, 0, 0x08, 0xb4, 0x10, 0, 0]);
        byd.handle_frame(&frame, &mut pack, &mut sink, "bg", 0);
        assert_eq!(pack.voltage_dv(), Some(0x10b4));
        assert_eq!(byd.kvs[KV_PID_VOLTAGE].get(), Some(0x10b4));
    }

    #[test]
    fn s4_pid_current() {
        let config = config();
        let mut byd = Byd::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let ack_frame = Frame::new(0x7EF, [0, 0, 0, 0x09, 0x88, 0x13, 0, 0]);
        let (replies, recognized) = byd.handle_frame(&ack_frame, &mut pack, &mut sink, "bg", 0);
        assert!(replies.is_empty());
        assert!(recognized);
        assert_eq!(byd.kvs[KV_PID_CURRENT].get(), Some(0));
    }

    #[test]
    fn flow_control_ack_sent_on_first_frame_marker() {
        let config = config();
        let mut byd = Byd::attach(&config);
        let mut pack = PackState::new();
        let mut sink = NullSink;
        let frame = Frame::new(0x7EF, [0x10, 0, 0, 0, 0, 0, 0, 0]);
        let (replies, _) = byd.handle_frame(&frame, &mut pack, &mut sink, "bg", 0);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, 0x7E7);
        assert_eq!(replies[0].data, [0x30, 0x08, 0x05, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn tick_50ms_nonce_decrements_and_pattern_switches() {
        let config = config();
        let mut byd = Byd::attach(&config);
        let first = byd.tick_50ms();
        assert_eq!(first.data[2], 0xa0);
        assert_eq!(first.data[6], 0xaf);
        for _ in 0..CHANGE_TICKS {
            byd.tick_50ms();
        }
        let after = byd.tick_50ms();
        assert_eq!(after.data[2], 0x00);
        assert_eq!(after.data[3], 0x22);
        assert_eq!(after.data[5], 0x31);
    }

    #[test]
    fn tick_100ms_clips_voltage_when_contactor_open() {
        let config = config();
        let mut byd = Byd::attach(&config);
        byd.kvs[KV_VOLTAGE] = Kv::new("", KvType::Voltage, 1);
        byd.kvs[KV_VOLTAGE].update(&mut NullSink, "bg", "battery", 0, 4276);
        let f = byd.tick_100ms(false);
        assert_eq!(f.data[4], 12);
        assert_eq!(f.data[5], 0);
    }
}
