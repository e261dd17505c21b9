// Telemetry key/value points: dedup-on-equal, ten-second throttle with value
// retention, and the periodic "teleperiod" bulk republish sweep.
//
// Grounded on batgw_kv_update/batgw_kv_publish in the reference gateway:
// a KV stores a fixed-point signed integer and only ever talks to the
// broker through the `KvSink` trait, so the dedup/throttle logic here is
// exercised by unit tests with no network or clock dependency.

/// Minimum interval between two publishes of the same KV triggered by
/// `update`; the teleperiod sweep bypasses this (see `sweep`).
const THROTTLE_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvType {
    Temperature,
    Voltage,
    Current,
    Power,
    AmpHour,
    WattHour,
    Energy,
    Percent,
    Count,
    Raw,
}

impl KvType {
    /// The trailing topic segment for this type.
    pub fn topic_name(self) -> &'static str {
        match self {
            KvType::Temperature => "temperature",
            KvType::Voltage => "voltage",
            KvType::Current => "current",
            KvType::Power => "power",
            KvType::AmpHour => "amphour",
            KvType::WattHour => "watthour",
            KvType::Energy => "energy",
            KvType::Percent => "percent",
            KvType::Count => "count",
            KvType::Raw => "raw",
        }
    }
}

/// A template for constructing a `Kv` — the compile-time-constant part of
/// a driver's `kvs_tpl` table (key/type/precision), separate from runtime
/// state (value/last-published).
#[derive(Debug, Clone, Copy)]
pub struct KvTpl {
    pub key: &'static str,
    pub kv_type: KvType,
    pub precision: u8,
}

/// Something a `Kv` can publish a formatted topic/payload pair to.
/// Implemented by the broker session; kept as a trait so KV logic is
/// testable without a live MQTT connection.
pub trait KvSink {
    fn publish(&mut self, topic: &str, payload: &str);
}

#[derive(Debug, Clone, Copy)]
pub struct Kv {
    key: &'static str,
    kv_type: KvType,
    precision: u8,
    value: i32,
    last_published: u64,
}

impl Kv {
    /// Sentinel meaning "never set"; a fresh KV starts here so its first
    /// real assignment is always treated as a change.
    pub const NEVER_SET: i32 = i32::MIN;

    pub fn new(key: &'static str, kv_type: KvType, precision: u8) -> Self {
        debug_assert!(key.len() <= 15, "kv key {key:?} exceeds 15 chars");
        debug_assert!(precision <= 4, "kv precision {precision} out of range");
        Kv {
            key,
            kv_type,
            precision,
            value: Self::NEVER_SET,
            last_published: 0,
        }
    }

    pub fn from_tpl(tpl: &KvTpl) -> Self {
        Kv::new(tpl.key, tpl.kv_type, tpl.precision)
    }

    /// The raw stored value (`None` if never set).
    pub fn get(&self) -> Option<i32> {
        (self.value != Self::NEVER_SET).then_some(self.value)
    }

    pub fn topic(&self, prefix: &str, scope: &str) -> String {
        if self.key.is_empty() {
            format!("{prefix}/{scope}/{}", self.kv_type.topic_name())
        } else {
            format!("{prefix}/{scope}/{}/{}", self.key, self.kv_type.topic_name())
        }
    }

    /// Format `value` at `precision` fractional digits: `±W` at precision 0,
    /// `±W.FFFF` (exactly `precision` digits) otherwise.
    pub fn format(value: i32, precision: u8) -> String {
        if precision == 0 {
            return value.to_string();
        }
        let div = 10i64.pow(precision as u32);
        let neg = value < 0;
        let abs = (value as i64).unsigned_abs();
        let whole = abs / div as u64;
        let frac = abs % div as u64;
        format!(
            "{}{}.{:0width$}",
            if neg { "-" } else { "" },
            whole,
            frac,
            width = precision as usize
        )
    }

    /// Dedup + throttle update: suppressed entirely if `value` is unchanged;
    /// otherwise stored, and published only if at least ten seconds have
    /// elapsed since the last publish (`now_secs` is a monotonic clock
    /// reading supplied by the caller, not read internally, so this stays
    /// pure and deterministic for tests).
    pub fn update(&mut self, sink: &mut dyn KvSink, prefix: &str, scope: &str, now_secs: u64, value: i32) {
        if self.value == value {
            return;
        }
        self.value = value;
        if now_secs.saturating_sub(self.last_published) < THROTTLE_SECS {
            return;
        }
        self.last_published = now_secs;
        self.publish_now(sink, prefix, scope);
    }

    fn publish_now(&self, sink: &mut dyn KvSink, prefix: &str, scope: &str) {
        if self.value == Self::NEVER_SET {
            return;
        }
        let topic = self.topic(prefix, scope);
        let payload = Self::format(self.value, self.precision);
        sink.publish(&topic, &payload);
    }

    /// Teleperiod sweep: publish unconditionally if set, bypassing the
    /// throttle window. Deliberately does **not** touch `last_published` —
    /// per the reference implementation this is accepted as intentional
    /// (see DESIGN.md open question iii).
    pub fn sweep(&self, sink: &mut dyn KvSink, prefix: &str, scope: &str) {
        self.publish_now(sink, prefix, scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        published: Vec<(String, String)>,
    }

    impl KvSink for RecordingSink {
        fn publish(&mut self, topic: &str, payload: &str) {
            self.published.push((topic.to_string(), payload.to_string()));
        }
    }

    #[test]
    fn format_round_trip_all_precisions() {
        for precision in 0..=4u8 {
            for value in [0i32, 1, -1, 4276, -4276, 99999] {
                let s = Kv::format(value, precision);
                let parsed = parse_back(&s, precision);
                assert_eq!(parsed, value, "precision={precision} value={value} formatted={s}");
            }
        }
    }

    fn parse_back(s: &str, precision: u8) -> i32 {
        if precision == 0 {
            return s.parse().unwrap();
        }
        let (sign, rest) = match s.strip_prefix('-') {
            Some(r) => (-1i32, r),
            None => (1i32, s),
        };
        let (whole, frac) = rest.split_once('.').unwrap();
        let whole: i64 = whole.parse().unwrap();
        let frac: i64 = frac.parse().unwrap();
        let div = 10i64.pow(precision as u32);
        sign * ((whole * div + frac) as i32)
    }

    #[test]
    fn format_s1_pack_voltage() {
        assert_eq!(Kv::format(4276, 1), "427.6");
    }

    #[test]
    fn dedup_suppresses_equal_update() {
        let mut kv = Kv::new("voltage", KvType::Voltage, 1);
        let mut sink = RecordingSink::default();
        kv.update(&mut sink, "bg", "battery", 100, 4276);
        kv.update(&mut sink, "bg", "battery", 101, 4276);
        assert_eq!(sink.published.len(), 1);
    }

    #[test]
    fn throttle_retains_value_but_skips_publish() {
        let mut kv = Kv::new("voltage", KvType::Voltage, 1);
        let mut sink = RecordingSink::default();
        kv.update(&mut sink, "bg", "battery", 0, 100);
        assert_eq!(sink.published.len(), 1);

        kv.update(&mut sink, "bg", "battery", 5, 101);
        assert_eq!(sink.published.len(), 1, "under throttle window, no publish");
        assert_eq!(kv.get(), Some(101), "value is still retained");

        kv.update(&mut sink, "bg", "battery", 10, 102);
        assert_eq!(sink.published.len(), 2, "throttle window elapsed, publishes");
    }

    #[test]
    fn teleperiod_sweep_ignores_throttle() {
        let mut kv = Kv::new("voltage", KvType::Voltage, 1);
        let mut sink = RecordingSink::default();
        kv.update(&mut sink, "bg", "battery", 0, 100);
        assert_eq!(sink.published.len(), 1);

        kv.sweep(&mut sink, "bg", "battery");
        kv.sweep(&mut sink, "bg", "battery");
        assert_eq!(sink.published.len(), 3, "sweep publishes regardless of throttle");
    }

    #[test]
    fn never_set_kv_is_not_swept() {
        let kv = Kv::new("voltage", KvType::Voltage, 1);
        let mut sink = RecordingSink::default();
        kv.sweep(&mut sink, "bg", "battery");
        assert!(sink.published.is_empty());
    }

    #[test]
    fn topic_omits_empty_key_segment() {
        let kv = Kv::new("", KvType::Raw, 0);
        assert_eq!(kv.topic("bg", "inverter"), "bg/inverter/raw");
        let kv2 = Kv::new("soc", KvType::Percent, 1);
        assert_eq!(kv2.topic("bg", "battery"), "bg/battery/soc/percent");
    }
}
