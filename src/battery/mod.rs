// Battery-driver interface: a compile-time-selected dialect (BYD or MG4)
// behind one trait, dispatched through a sum-typed `BatteryKind` rather than
// `dyn Trait` so the CAN-receive path never allocates or indirects through a
// vtable. Mirrors the reference `struct batgw_battery` record of function
// pointers (check/config/attach/dispatch/teleperiod), generalized to Rust's
// trait-plus-enum idiom per SPEC_FULL.md §4.E/§9.

pub mod byd;
pub mod mg4;

use crate::can::Frame;
use crate::config::{BatteryConfig, BatteryProtocol};
use crate::error::GatewayError;
use crate::kv::KvSink;
use crate::pack::PackState;

/// A battery protocol driver: owns its own KV tables and poll/emitter
/// cadence state, and mutates pack state only through its setters.
pub trait BatteryDriver: Sized {
    /// Reject a config that conflicts with this driver's hardware constants
    /// (e.g. a non-zero cell-voltage bound the driver itself owns).
    fn check(config: &BatteryConfig) -> Result<(), GatewayError>;

    /// Fill zero-valued config fields with this driver's manufacturer
    /// defaults (rated capacity, cell-voltage bounds, cell count, ...).
    fn apply_defaults(config: &mut BatteryConfig);

    fn attach(config: &BatteryConfig) -> Self;

    /// Seed pack state from config and return the frames to send once at
    /// startup (priming the periodic emitters' first tick).
    fn dispatch(&mut self, config: &BatteryConfig, pack: &mut PackState) -> Vec<Frame>;

    /// Handle one inbound frame. Returns any immediate reply frames (e.g.
    /// BYD's ISO-TP flow-control ack) and whether the frame should rearm the
    /// liveness watchdog.
    fn handle_frame(
        &mut self,
        frame: &Frame,
        pack: &mut PackState,
        sink: &mut dyn KvSink,
        topic_prefix: &str,
        now_secs: u64,
    ) -> (Vec<Frame>, bool);

    fn teleperiod(&self, topic_prefix: &str, sink: &mut dyn KvSink);
}

pub enum BatteryKind {
    Byd(byd::Byd),
    Mg4(mg4::Mg4),
}

impl BatteryKind {
    pub fn check(protocol: BatteryProtocol, config: &BatteryConfig) -> Result<(), GatewayError> {
        match protocol {
            BatteryProtocol::Byd => byd::Byd::check(config),
            BatteryProtocol::Mg4 => mg4::Mg4::check(config),
        }
    }

    pub fn apply_defaults(protocol: BatteryProtocol, config: &mut BatteryConfig) {
        match protocol {
            BatteryProtocol::Byd => byd::Byd::apply_defaults(config),
            BatteryProtocol::Mg4 => mg4::Mg4::apply_defaults(config),
        }
    }

    pub fn attach(config: &BatteryConfig) -> Self {
        match config.protocol {
            BatteryProtocol::Byd => BatteryKind::Byd(byd::Byd::attach(config)),
            BatteryProtocol::Mg4 => BatteryKind::Mg4(mg4::Mg4::attach(config)),
        }
    }

    pub fn dispatch(&mut self, config: &BatteryConfig, pack: &mut PackState) -> Vec<Frame> {
        match self {
            BatteryKind::Byd(d) => d.dispatch(config, pack),
            BatteryKind::Mg4(d) => d.dispatch(config, pack),
        }
    }

    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        pack: &mut PackState,
        sink: &mut dyn KvSink,
        topic_prefix: &str,
        now_secs: u64,
    ) -> (Vec<Frame>, bool) {
        match self {
            BatteryKind::Byd(d) => d.handle_frame(frame, pack, sink, topic_prefix, now_secs),
            BatteryKind::Mg4(d) => d.handle_frame(frame, pack, sink, topic_prefix, now_secs),
        }
    }

    pub fn teleperiod(&self, topic_prefix: &str, sink: &mut dyn KvSink) {
        match self {
            BatteryKind::Byd(d) => d.teleperiod(topic_prefix, sink),
            BatteryKind::Mg4(d) => d.teleperiod(topic_prefix, sink),
        }
    }

    /// 200 ms poll round-robin tick; `None` for drivers with no PID poll.
    pub fn poll_tick(&mut self) -> Option<Frame> {
        match self {
            BatteryKind::Byd(d) => Some(d.poll_tick()),
            BatteryKind::Mg4(_) => None,
        }
    }

    /// 50 ms handshake/keep-alive tick; `None` if the dialect has none.
    pub fn tick_50ms(&mut self) -> Option<Frame> {
        match self {
            BatteryKind::Byd(d) => Some(d.tick_50ms()),
            BatteryKind::Mg4(_) => None,
        }
    }

    /// 100 ms periodic tick; BYD's pack-voltage frame needs the inverter's
    /// contactor state, MG4's keep-alive does not.
    pub fn tick_100ms(&mut self, contactor_closed: bool) -> Option<Frame> {
        match self {
            BatteryKind::Byd(d) => Some(d.tick_100ms(contactor_closed)),
            BatteryKind::Mg4(d) => Some(d.tick_keepalive()),
        }
    }

    /// 10 ms tick; only MG4's contactor sequence uses this cadence.
    pub fn tick_10ms(&mut self) -> Option<Frame> {
        match self {
            BatteryKind::Byd(_) => None,
            BatteryKind::Mg4(d) => Some(d.tick_contactor()),
        }
    }
}
