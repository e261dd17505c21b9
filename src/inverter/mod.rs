// Inverter driver interface: impersonates a BYD battery module towards the
// inverter. Single concrete implementation today (`byd_can`), kept behind
// the same trait shape as the battery side for symmetry and future
// extension (§4.G, §9).

pub mod byd_can;

use crate::can::Frame;
use crate::config::{InverterConfig, InverterProtocol};
use crate::error::GatewayError;
use crate::kv::KvSink;
use crate::pack::PackState;
use crate::safety::Safety;

/// The inverter side of the compile-time driver table (§4.E); a single
/// variant today, kept as an enum rather than a bare struct for symmetry
/// with `BatteryKind` and so a second inverter dialect slots in the same
/// way a second battery dialect did.
pub enum InverterKind {
    BydCan(byd_can::BydCan),
}

impl InverterKind {
    pub fn check(protocol: InverterProtocol, config: &InverterConfig) -> Result<(), GatewayError> {
        match protocol {
            InverterProtocol::BydCan => byd_can::BydCan::check(config),
        }
    }

    pub fn attach(config: &InverterConfig) -> Self {
        match config.protocol {
            InverterProtocol::BydCan => InverterKind::BydCan(byd_can::BydCan::attach(config)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn handle_frame(
        &mut self,
        frame: &Frame,
        pack: &PackState,
        inverter: &mut crate::pack::InverterState,
        sink: &mut dyn KvSink,
        topic_prefix: &str,
        now_secs: u64,
    ) -> (Vec<Frame>, bool) {
        match self {
            InverterKind::BydCan(d) => d.handle_frame(frame, pack, inverter, sink, topic_prefix, now_secs),
        }
    }

    pub fn tick_2s(
        &mut self,
        pack: &PackState,
        safety: &Safety,
        token: u32,
        config: &crate::config::BatteryConfig,
        sink: &mut dyn KvSink,
        topic_prefix: &str,
        now_secs: u64,
    ) -> Option<Frame> {
        match self {
            InverterKind::BydCan(d) => d.tick_2s(pack, safety, token, config, sink, topic_prefix, now_secs),
        }
    }

    pub fn tick_10s(
        &mut self,
        pack: &PackState,
        sink: &mut dyn KvSink,
        topic_prefix: &str,
        now_secs: u64,
    ) -> Vec<Frame> {
        match self {
            InverterKind::BydCan(d) => d.tick_10s(pack, sink, topic_prefix, now_secs),
        }
    }

    pub fn tick_60s(&self) -> Frame {
        match self {
            InverterKind::BydCan(d) => d.tick_60s(),
        }
    }

    pub fn on_watchdog_expire(&mut self, inverter: &mut crate::pack::InverterState) {
        match self {
            InverterKind::BydCan(d) => d.on_watchdog_expire(inverter),
        }
    }

    pub fn teleperiod(&self, topic_prefix: &str, sink: &mut dyn KvSink) {
        match self {
            InverterKind::BydCan(d) => d.teleperiod(topic_prefix, sink),
        }
    }

    /// Whether the identity handshake has fired and the cyclic 2s/10s/60s
    /// emitters should be running (§4.G: passive until `0x151[0]==0x01`
    /// with the pack running; reset to passive on watchdog expiry).
    pub fn is_active(&self) -> bool {
        match self {
            InverterKind::BydCan(d) => d.is_active(),
        }
    }
}

pub trait InverterDriver: Sized {
    fn check(config: &InverterConfig) -> Result<(), GatewayError>;
    fn attach(config: &InverterConfig) -> Self;

    /// Handle one inbound frame; returns any frames to send immediately
    /// (the handshake sequence) and whether the frame rearms the 60 s
    /// liveness watchdog.
    #[allow(clippy::too_many_arguments)]
    fn handle_frame(
        &mut self,
        frame: &Frame,
        pack: &PackState,
        inverter: &mut crate::pack::InverterState,
        sink: &mut dyn KvSink,
        topic_prefix: &str,
        now_secs: u64,
    ) -> (Vec<Frame>, bool);

    fn tick_2s(
        &mut self,
        pack: &PackState,
        safety: &Safety,
        token: u32,
        config: &crate::config::BatteryConfig,
        sink: &mut dyn KvSink,
        topic_prefix: &str,
        now_secs: u64,
    ) -> Option<Frame>;

    fn tick_10s(
        &mut self,
        pack: &PackState,
        sink: &mut dyn KvSink,
        topic_prefix: &str,
        now_secs: u64,
    ) -> Vec<Frame>;

    fn tick_60s(&self) -> Frame;

    /// Mark the driver passive again so the next `0x151[0]==0x01` re-runs
    /// the handshake (§4.G "On watchdog expiry").
    fn on_watchdog_expire(&mut self, inverter: &mut crate::pack::InverterState);

    fn teleperiod(&self, topic_prefix: &str, sink: &mut dyn KvSink);
}
