// BYD-CAN inverter driver: identity handshake gated on pack liveness,
// cyclic 2 s/10 s/60 s emitters, and contactor inference from 0x091.
// Grounded on examples/original_source/inverter/i_byd_can.c.

use super::InverterDriver;
use crate::can::Frame;
use crate::config::{BatteryConfig, InverterConfig};
use crate::error::GatewayError;
use crate::kv::{Kv, KvSink, KvType};
use crate::pack::{InverterState, PackState};
use crate::safety::{self, Safety};

const VENDOR: &[u8] = b"BYD\0";
const PRODUCT: &[u8] = b"Battery-Box Premium HVS\0";

const KV_MAX_CHARGE_DA: usize = 0;
const KV_MAX_DISCHARGE_DA: usize = 1;
const KV_RECV_VOLTAGE: usize = 2;
const KV_TEMPERATURE: usize = 3;
const KV_COUNT: usize = 4;

fn kv_table() -> [Kv; KV_COUNT] {
    [
        Kv::new("max-charge", KvType::Current, 0),
        Kv::new("max-discharge", KvType::Current, 0),
        Kv::new("voltage", KvType::Voltage, 1),
        Kv::new("", KvType::Temperature, 0),
    ]
}

pub struct BydCan {
    /// One-time latch: stays false until the first `0x151` byte[0]==0x01 is
    /// observed while the pack is running; once true, every subsequent
    /// frame is processed normally (re-triggering the handshake again on
    /// the next such `0x151` is the only way it becomes passive again, per
    /// the watchdog-expiry note in §4.G).
    active: bool,
    kvs: [Kv; KV_COUNT],
}

impl InverterDriver for BydCan {
    fn check(config: &InverterConfig) -> Result<(), GatewayError> {
        if config.ifname.is_empty() {
            return Err(GatewayError::config("inverter", "ifname must not be empty"));
        }
        Ok(())
    }

    fn attach(_config: &InverterConfig) -> Self {
        BydCan {
            active: false,
            kvs: kv_table(),
        }
    }

    fn handle_frame(
        &mut self,
        frame: &Frame,
        pack: &PackState,
        inverter: &mut InverterState,
        sink: &mut dyn KvSink,
        prefix: &str,
        now: u64,
    ) -> (Vec<Frame>, bool) {
        if !self.active {
            if !(frame.id == 0x151 && frame.data[0] == 0x01 && pack.running()) {
                return (Vec::new(), false);
            }
            self.active = true;
        }

        let liveness = matches!(frame.id, 0x019 | 0x0D1 | 0x111 | 0x151);
        if liveness {
            inverter.set_running();
        }

        let mut out = Vec::new();
        match frame.id {
            0x151 => {
                if frame.data[0] == 0x01 {
                    out.extend(self.handshake(pack));
                }
            }
            0x091 => {
                let inverter_dv = frame.be16(0);
                self.kvs[KV_RECV_VOLTAGE].update(sink, prefix, "inverter", now, inverter_dv as i32);
                let closed = match pack.voltage_dv() {
                    Some(pack_dv) => (inverter_dv as i64 - pack_dv as i64).abs() <= 20,
                    None => false,
                };
                inverter.set_contactor(closed);
                self.kvs[KV_TEMPERATURE].update(sink, prefix, "inverter", now, frame.be16(4) as i32);
            }
            _ => {}
        }

        (out, liveness)
    }

    fn tick_2s(
        &mut self,
        pack: &PackState,
        safety: &Safety,
        token: u32,
        config: &BatteryConfig,
        sink: &mut dyn KvSink,
        prefix: &str,
        now: u64,
    ) -> Option<Frame> {
        let min_dv = pack.min_voltage_dv()?;
        let max_dv = pack.max_voltage_dv()?;

        let discharge = safety::discharge_da(safety, token, pack, config);
        let charge = safety::charge_da(safety, token, pack, config);
        self.kvs[KV_MAX_DISCHARGE_DA].update(sink, prefix, "inverter", now, discharge as i32);
        self.kvs[KV_MAX_CHARGE_DA].update(sink, prefix, "inverter", now, charge as i32);

        let mut f = Frame::new(0x110, [0; 8]);
        f.set_be16(0, (max_dv - 20) as u16);
        f.set_be16(2, (min_dv + 20) as u16);
        f.set_be16(4, discharge as u16);
        f.set_be16(6, charge as u16);
        Some(f)
    }

    fn tick_10s(&mut self, pack: &PackState, sink: &mut dyn KvSink, prefix: &str, now: u64) -> Vec<Frame> {
        let mut frames = Vec::new();

        if let (Some(soc), Some(ah)) = (pack.soc_cpct(), pack.rated_capacity_ah()) {
            let mut f = Frame::new(0x150, [0; 8]);
            f.set_be16(0, soc as u16);
            f.set_be16(2, 9900);
            f.set_be16(4, ((ah as u64 * soc as u64) / 10_000) as u16);
            f.set_be16(6, ah as u16);
            frames.push(f);
        }

        if let Some(avg_temp) = pack.avg_temp_dc() {
            let dv = pack.voltage_dv().unwrap_or(0);
            self.kvs[KV_RECV_VOLTAGE].update(sink, prefix, "inverter", now, dv as i32);
            let mut f = Frame::new(0x1D0, [0; 8]);
            f.set_be16(0, dv as u16);
            f.set_be16(2, 0);
            f.set_be16(4, avg_temp as u16);
            frames.push(f);
        }

        if let (Some(max_temp), Some(min_temp)) = (pack.max_temp_dc(), pack.min_temp_dc()) {
            let mut f = Frame::new(0x210, [0; 8]);
            f.set_be16(0, max_temp as u16);
            f.set_be16(2, min_temp as u16);
            frames.push(f);
        }

        frames
    }

    fn tick_60s(&self) -> Frame {
        Frame::new(0x190, [0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00])
    }

    fn on_watchdog_expire(&mut self, inverter: &mut InverterState) {
        inverter.set_stopped();
        inverter.set_contactor(false);
        self.active = false;
    }

    fn teleperiod(&self, prefix: &str, sink: &mut dyn KvSink) {
        for kv in &self.kvs {
            kv.sweep(sink, prefix, "inverter");
        }
    }
}

impl BydCan {
    /// Whether the handshake has fired and the cyclic emitters should run.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Gated on `rated_capacity_Wh` being known; skipped entirely if absent.
    fn handshake(&self, pack: &PackState) -> Vec<Frame> {
        let wh = match pack.rated_capacity_wh() {
            Some(wh) => wh,
            None => return Vec::new(),
        };
        let kwh_tenths = (wh / 100) as u16;

        let mut frames = Vec::new();

        let mut f250 = Frame::new(0x250, [0x03, 0x29, 0x00, 0x66, 0, 0, 0x02, 0x09]);
        f250.set_be16(4, kwh_tenths);
        frames.push(f250);

        frames.push(Frame::new(0x290, [0x06, 0x37, 0x10, 0xD9, 0, 0, 0, 0]));
        frames.extend(chunk_string(0x2D0, VENDOR));
        frames.extend(chunk_string(0x3D0, PRODUCT));

        frames
    }
}

/// Splits `s` across frames of `id`: byte[0] is the packet index (starting
/// at 0), bytes[1..8] carry up to 7 bytes of string content, and the final
/// packet is zero-padded.
fn chunk_string(id: u16, s: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut idx: u8 = 0;
    let mut rest = s;
    loop {
        let take = rest.len().min(7);
        let mut data = [0u8; 8];
        data[0] = idx;
        data[1..1 + take].copy_from_slice(&rest[..take]);
        frames.push(Frame::new(id, data));
        rest = &rest[take..];
        if rest.is_empty() {
            break;
        }
        idx += 1;
    }
    frames
}
