// Configuration schema and loading: TOML file plus `-D name=value` CLI
// overrides, mirroring the `mqtt{}` / `battery{}` / `inverter{}` sections
// of the reference implementation's config header.

use std::path::Path;

use serde::Deserialize;

use crate::error::GatewayError;

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTT_TOPIC: &str = "battery-gateway";
const DEFAULT_MQTT_TELEPERIOD: u32 = 300;
const MIN_TELEPERIOD: u32 = 4;
const MAX_TELEPERIOD: u32 = 3600;
const DEFAULT_MQTT_KEEPALIVE: u16 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryProtocol {
    Byd,
    Mg4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InverterProtocol {
    BydCan,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub pass: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default = "default_mqtt_keepalive")]
    pub keepalive: u16,
    #[serde(default = "default_mqtt_teleperiod")]
    pub teleperiod: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_timeout_secs")]
    pub reconnect_timeout_secs: u64,
}

fn default_mqtt_port() -> u16 {
    DEFAULT_MQTT_PORT
}
fn default_mqtt_topic() -> String {
    DEFAULT_MQTT_TOPIC.to_string()
}
fn default_mqtt_teleperiod() -> u32 {
    DEFAULT_MQTT_TELEPERIOD
}
fn default_mqtt_keepalive() -> u16 {
    DEFAULT_MQTT_KEEPALIVE
}
fn default_client_id() -> String {
    "batgw".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
fn default_reconnect_timeout_secs() -> u64 {
    DEFAULT_RECONNECT_TIMEOUT_SECS
}

impl MqttConfig {
    fn normalize(&mut self) {
        self.teleperiod = self.teleperiod.clamp(MIN_TELEPERIOD, MAX_TELEPERIOD);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatteryConfig {
    pub protocol: BatteryProtocol,
    pub ifname: String,
    #[serde(default)]
    pub rated_capacity_ah: u32,
    #[serde(default)]
    pub rated_voltage_dv: u32,
    #[serde(default)]
    pub rated_capacity_wh: u32,
    #[serde(default)]
    pub min_voltage_dv: u32,
    #[serde(default)]
    pub max_voltage_dv: u32,
    #[serde(default)]
    pub ncells: u32,
    #[serde(default)]
    pub min_cell_voltage_mv: u32,
    #[serde(default)]
    pub max_cell_voltage_mv: u32,
    #[serde(default)]
    pub dev_cell_voltage_mv: u32,
    /// Site-configured charge/discharge limits, independent of what the
    /// manufacturer reports over CAN; the safety envelope uses the smaller
    /// of the two (§4.D).
    #[serde(default)]
    pub charge_w: u32,
    #[serde(default)]
    pub discharge_w: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InverterConfig {
    pub protocol: InverterProtocol,
    pub ifname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mqtt: Option<MqttConfig>,
    pub battery: BatteryConfig,
    pub inverter: InverterConfig,
}

impl Config {
    /// Parse `path` as TOML, apply `-D key=value` overrides (dotted paths
    /// into the document, e.g. `battery.ifname=can2`), then validate.
    pub fn load(path: &Path, overrides: &[(String, String)]) -> Result<Config, GatewayError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config("file", format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&text, overrides)
    }

    pub fn parse(text: &str, overrides: &[(String, String)]) -> Result<Config, GatewayError> {
        let mut doc: toml::Value = text
            .parse()
            .map_err(|e| GatewayError::config("file", format!("invalid TOML: {e}")))?;

        for (key, value) in overrides {
            set_dotted(&mut doc, key, value);
        }

        let merged = toml::to_string(&doc)
            .map_err(|e| GatewayError::config("file", format!("cannot re-serialize overrides: {e}")))?;
        let mut config: Config = toml::from_str(&merged)
            .map_err(|e| GatewayError::config("file", format!("schema mismatch: {e}")))?;

        if let Some(mqtt) = &mut config.mqtt {
            mqtt.normalize();
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.battery.ifname.is_empty() {
            return Err(GatewayError::config("battery", "ifname must not be empty"));
        }
        if self.inverter.ifname.is_empty() {
            return Err(GatewayError::config("inverter", "ifname must not be empty"));
        }
        if self.battery.ifname == self.inverter.ifname {
            return Err(GatewayError::config(
                "battery/inverter",
                "battery and inverter cannot share a CAN interface",
            ));
        }
        Ok(())
    }
}

/// Set `doc[a][b][c] = value` for a dotted key `a.b.c`, parsing `value` as
/// TOML scalar where possible (so `-D mqtt.port=1884` yields an integer,
/// not the string `"1884"`), creating intermediate tables as needed.
fn set_dotted(doc: &mut toml::Value, dotted_key: &str, value: &str) {
    let parsed_value: toml::Value = value
        .parse()
        .unwrap_or_else(|_| toml::Value::String(value.to_string()));

    let mut parts = dotted_key.split('.').peekable();
    let mut cursor = doc;
    while let Some(part) = parts.next() {
        if !cursor.is_table() {
            *cursor = toml::Value::Table(Default::default());
        }
        let table = cursor.as_table_mut().expect("just ensured table");
        if parts.peek().is_none() {
            table.insert(part.to_string(), parsed_value);
            return;
        }
        cursor = table
            .entry(part.to_string())
            .or_insert_with(|| toml::Value::Table(Default::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [battery]
        protocol = "byd"
        ifname = "can0"

        [inverter]
        protocol = "byd-can"
        ifname = "can1"
    "#;

    #[test]
    fn minimal_config_parses_with_mqtt_absent() {
        let config = Config::parse(MINIMAL, &[]).unwrap();
        assert!(config.mqtt.is_none());
        assert_eq!(config.battery.protocol, BatteryProtocol::Byd);
        assert_eq!(config.inverter.ifname, "can1");
    }

    #[test]
    fn teleperiod_defaults_and_clamps() {
        let with_mqtt = format!(
            "{MINIMAL}\n[mqtt]\nhost = \"localhost\"\nteleperiod = 1\n"
        );
        let config = Config::parse(&with_mqtt, &[]).unwrap();
        assert_eq!(config.mqtt.unwrap().teleperiod, MIN_TELEPERIOD);

        let with_mqtt_high = format!(
            "{MINIMAL}\n[mqtt]\nhost = \"localhost\"\nteleperiod = 99999\n"
        );
        let config = Config::parse(&with_mqtt_high, &[]).unwrap();
        assert_eq!(config.mqtt.unwrap().teleperiod, MAX_TELEPERIOD);
    }

    #[test]
    fn cli_override_wins_over_file_value() {
        let overrides = vec![("battery.ifname".to_string(), "can7".to_string())];
        let config = Config::parse(MINIMAL, &overrides).unwrap();
        assert_eq!(config.battery.ifname, "can7");
    }

    #[test]
    fn rejects_shared_can_interface() {
        let bad = r#"
            [battery]
            protocol = "byd"
            ifname = "can0"

            [inverter]
            protocol = "byd-can"
            ifname = "can0"
        "#;
        assert!(Config::parse(bad, &[]).is_err());
    }
}
