// Process supervisor: wires the battery driver, inverter driver, safety
// supervisor and broker session into a single cooperative event loop
// (§4.I, §5). This generalizes the teacher's multi-threaded
// `Arc<Mutex<_>>` + `thread::spawn` wiring into one `tokio::select!` task
// driven by a current-thread runtime, per SPEC_FULL.md §5: every branch
// borrows disjoint fields of `Gateway` and returns before the next
// iteration, so no reference survives a suspension point.

use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};

use crate::battery::BatteryKind;
use crate::broker::Broker;
use crate::can::{CanIface, Frame};
use crate::config::Config;
use crate::error::GatewayError;
use crate::inverter::InverterKind;
use crate::kv::KvSink;
use crate::pack::{InverterState, PackState};
use crate::safety::Safety;

const BATTERY_WATCHDOG: Duration = Duration::from_secs(10);
const INVERTER_WATCHDOG: Duration = Duration::from_secs(60);
const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(1);
const BATTERY_POLL_PERIOD: Duration = Duration::from_millis(200);
const TICK_50MS: Duration = Duration::from_millis(50);
const TICK_100MS: Duration = Duration::from_millis(100);
const TICK_10MS: Duration = Duration::from_millis(10);
const INVERTER_2S: Duration = Duration::from_secs(2);
const INVERTER_10S: Duration = Duration::from_secs(10);
const INVERTER_60S: Duration = Duration::from_secs(60);
const DEFAULT_TELEPERIOD_SECS: u64 = 300;
const DEFAULT_TOPIC_PREFIX: &str = "battery-gateway";
const DEFAULT_RECONNECT_AFTER: Duration = Duration::from_secs(30);

/// A `KvSink` that drops everything, used when no broker is configured or
/// while a session is down, so driver code never needs to special-case the
/// absence of a broker (§4.B publishing is best-effort and never fatal).
struct NullSink;

impl KvSink for NullSink {
    fn publish(&mut self, _topic: &str, _payload: &str) {}
}

/// The single gateway object the process owns (§3 "Ownership"): config,
/// pack/inverter state, the safety supervisor, both driver handles and
/// both CAN sockets, plus the optional broker session.
pub struct Gateway {
    config: Config,
    pack: PackState,
    inverter_state: InverterState,
    safety: Safety,
    battery: BatteryKind,
    inverter: InverterKind,
    battery_can: CanIface,
    inverter_can: CanIface,
    broker: Option<Broker>,
    pending_battery_frames: Vec<Frame>,
    start: Instant,
    battery_last_seen: Instant,
    inverter_last_seen: Instant,
    reconnect_at: Option<Instant>,
}

impl Gateway {
    /// Validate the protocol selections against `config` without opening
    /// any CAN interface or broker connection — backs the `-n` CLI flag.
    pub fn check_config(config: &Config) -> Result<(), GatewayError> {
        BatteryKind::check(config.battery.protocol, &config.battery)?;
        InverterKind::check(config.inverter.protocol, &config.inverter)?;
        Ok(())
    }

    /// Open both CAN interfaces, attach the selected drivers, seed pack
    /// state from config, and stage each driver's initial frames (§4.E
    /// `dispatch`) for `run()` to flush once the runtime is live.
    pub fn bootstrap(mut config: Config) -> Result<Self, GatewayError> {
        BatteryKind::check(config.battery.protocol, &config.battery)?;
        BatteryKind::apply_defaults(config.battery.protocol, &mut config.battery);
        InverterKind::check(config.inverter.protocol, &config.inverter)?;

        let battery_can = CanIface::open(&config.battery.ifname)?;
        let inverter_can = CanIface::open(&config.inverter.ifname)?;

        let mut battery = BatteryKind::attach(&config.battery);
        let inverter = InverterKind::attach(&config.inverter);

        let mut pack = PackState::new();
        let pending_battery_frames = battery.dispatch(&config.battery, &mut pack);

        let now = Instant::now();
        Ok(Gateway {
            config,
            pack,
            inverter_state: InverterState::new(),
            safety: Safety::new(),
            battery,
            inverter,
            battery_can,
            inverter_can,
            broker: None,
            pending_battery_frames,
            start: now,
            battery_last_seen: now,
            inverter_last_seen: now,
            reconnect_at: None,
        })
    }

    fn now_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    fn topic_prefix(&self) -> &str {
        self.config.mqtt.as_ref().map(|m| m.topic.as_str()).unwrap_or(DEFAULT_TOPIC_PREFIX)
    }

    /// Run the gateway until a CAN interface fails unrecoverably (§7.3);
    /// the caller treats that as a fatal process abort.
    pub async fn run(mut self) -> Result<(), GatewayError> {
        for frame in std::mem::take(&mut self.pending_battery_frames) {
            self.battery_can.send(frame).await?;
        }

        if let Some(mqtt) = self.config.mqtt.clone() {
            self.broker = Some(Broker::new(&mqtt));
        }

        let mut poll_tick = interval(BATTERY_POLL_PERIOD);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_50 = interval(TICK_50MS);
        tick_50.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_100 = interval(TICK_100MS);
        tick_100.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_10 = interval(TICK_10MS);
        tick_10.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = interval(HOUSEKEEPING_PERIOD);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inv_2s = interval(INVERTER_2S);
        inv_2s.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inv_10s = interval(INVERTER_10S);
        inv_10s.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inv_60s = interval(INVERTER_60S);
        inv_60s.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let teleperiod_secs = self.config.mqtt.as_ref().map(|m| m.teleperiod as u64).unwrap_or(DEFAULT_TELEPERIOD_SECS);
        let mut teleperiod = interval(Duration::from_secs(teleperiod_secs));
        teleperiod.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "gateway running: battery={} inverter={}",
            self.config.battery.ifname,
            self.config.inverter.ifname
        );

        loop {
            tokio::select! {
                frame = self.battery_can.recv() => {
                    self.on_battery_frame(frame?).await?;
                }
                frame = self.inverter_can.recv() => {
                    self.on_inverter_frame(frame?).await?;
                }
                _ = poll_tick.tick() => {
                    if let Some(frame) = self.battery.poll_tick() {
                        self.battery_can.send(frame).await?;
                    }
                }
                _ = tick_50.tick() => {
                    if let Some(frame) = self.battery.tick_50ms() {
                        self.battery_can.send(frame).await?;
                    }
                }
                _ = tick_100.tick() => {
                    let closed = self.inverter_state.contactor_closed();
                    if let Some(frame) = self.battery.tick_100ms(closed) {
                        self.battery_can.send(frame).await?;
                    }
                }
                _ = tick_10.tick() => {
                    if let Some(frame) = self.battery.tick_10ms() {
                        self.battery_can.send(frame).await?;
                    }
                }
                _ = housekeeping.tick() => {
                    self.run_housekeeping();
                }
                _ = inv_2s.tick(), if self.inverter.is_active() => {
                    self.on_inverter_2s().await?;
                }
                _ = inv_10s.tick(), if self.inverter.is_active() => {
                    self.on_inverter_10s().await?;
                }
                _ = inv_60s.tick(), if self.inverter.is_active() => {
                    let frame = self.inverter.tick_60s();
                    self.inverter_can.send(frame).await?;
                }
                _ = teleperiod.tick() => {
                    self.on_teleperiod();
                }
                event = async {
                    match self.broker.as_mut() {
                        Some(b) => b.poll().await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.on_broker_event(event);
                }
            }
        }
    }

    async fn on_battery_frame(&mut self, frame: Frame) -> Result<(), GatewayError> {
        let now = self.now_secs();
        let prefix = self.topic_prefix().to_string();
        let mut null = NullSink;
        let sink: &mut dyn KvSink = match self.broker.as_mut() {
            Some(b) => b,
            None => &mut null,
        };
        let (replies, recognized) = self.battery.handle_frame(&frame, &mut self.pack, sink, &prefix, now);
        if recognized {
            self.battery_last_seen = Instant::now();
        }
        for reply in replies {
            self.battery_can.send(reply).await?;
        }
        Ok(())
    }

    async fn on_inverter_frame(&mut self, frame: Frame) -> Result<(), GatewayError> {
        let now = self.now_secs();
        let prefix = self.topic_prefix().to_string();
        let mut null = NullSink;
        let sink: &mut dyn KvSink = match self.broker.as_mut() {
            Some(b) => b,
            None => &mut null,
        };
        let (out, liveness) =
            self.inverter
                .handle_frame(&frame, &self.pack, &mut self.inverter_state, sink, &prefix, now);
        if liveness {
            self.inverter_last_seen = Instant::now();
        }
        for frame in out {
            self.inverter_can.send(frame).await?;
        }
        Ok(())
    }

    async fn on_inverter_2s(&mut self) -> Result<(), GatewayError> {
        let now = self.now_secs();
        let prefix = self.topic_prefix().to_string();
        let token = self.safety.evaluate(&self.pack, &self.config.battery);
        let mut null = NullSink;
        let sink: &mut dyn KvSink = match self.broker.as_mut() {
            Some(b) => b,
            None => &mut null,
        };
        let frame = self
            .inverter
            .tick_2s(&self.pack, &self.safety, token, &self.config.battery, sink, &prefix, now);
        if let Some(frame) = frame {
            self.inverter_can.send(frame).await?;
        }
        Ok(())
    }

    async fn on_inverter_10s(&mut self) -> Result<(), GatewayError> {
        let now = self.now_secs();
        let prefix = self.topic_prefix().to_string();
        let mut null = NullSink;
        let sink: &mut dyn KvSink = match self.broker.as_mut() {
            Some(b) => b,
            None => &mut null,
        };
        let frames = self.inverter.tick_10s(&self.pack, sink, &prefix, now);
        for frame in frames {
            self.inverter_can.send(frame).await?;
        }
        Ok(())
    }

    fn on_teleperiod(&mut self) {
        let prefix = self.topic_prefix().to_string();
        let mut null = NullSink;
        let sink: &mut dyn KvSink = match self.broker.as_mut() {
            Some(b) => b,
            None => &mut null,
        };
        self.battery.teleperiod(&prefix, sink);
        self.inverter.teleperiod(&prefix, sink);
    }

    /// Watchdog checks and broker reconnect, all on a 1 s cadence rather
    /// than one timer per watchdog — the exact rearm instants are tracked
    /// in `battery_last_seen`/`inverter_last_seen`/`reconnect_at` and this
    /// just samples them (§5 "Timers").
    fn run_housekeeping(&mut self) {
        let now = Instant::now();

        if self.pack.running() && now.duration_since(self.battery_last_seen) >= BATTERY_WATCHDOG {
            log::warn!("battery watchdog expired after {BATTERY_WATCHDOG:?} of silence; marking pack stopped");
            self.pack.set_stopped();
        }

        if self.inverter_state.running() && now.duration_since(self.inverter_last_seen) >= INVERTER_WATCHDOG {
            log::warn!("inverter watchdog expired after {INVERTER_WATCHDOG:?} of silence");
            self.inverter.on_watchdog_expire(&mut self.inverter_state);
        }

        if self.broker.is_none() {
            if let Some(mqtt) = self.config.mqtt.clone() {
                if self.reconnect_at.map_or(true, |at| now >= at) {
                    log::info!("attempting broker reconnect to {}:{}", mqtt.host, mqtt.port);
                    self.broker = Some(Broker::new(&mqtt));
                    self.reconnect_at = None;
                }
            }
        }
    }

    fn on_broker_event(&mut self, event: Result<rumqttc::Event, rumqttc::ConnectionError>) {
        match event {
            Ok(_) => {}
            Err(e) => {
                let reconnect_after = self.broker.as_ref().map(|b| b.reconnect_after).unwrap_or(DEFAULT_RECONNECT_AFTER);
                log::warn!("broker session error: {e}; reconnecting in {reconnect_after:?}");
                self.broker = None;
                self.reconnect_at = Some(Instant::now() + reconnect_after);
            }
        }
    }
}
