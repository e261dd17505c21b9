// Battery gateway entry point: CLI parsing, config load/validate, and
// handing off to the process supervisor (§4.I, §6). Mirrors the flag set
// of the reference binary (`-d -D -f -n -v`) with `clap`'s derive API.

mod battery;
mod broker;
mod can;
mod config;
mod error;
mod gateway;
mod inverter;
mod kv;
mod pack;
mod safety;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use crate::config::Config;
use crate::gateway::Gateway;

#[derive(Debug, Parser)]
#[command(name = "batgw", about = "CAN-to-CAN battery gateway with MQTT telemetry")]
struct Cli {
    /// Enable debug logging.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Override a dotted config key, e.g. `-D mqtt.port=1884`. Repeatable.
    #[arg(short = 'D', value_name = "name=value")]
    define: Vec<String>,

    /// Path to the TOML config file.
    #[arg(short = 'f', long = "file", default_value = "batgw.toml")]
    config: PathBuf,

    /// Parse and validate the config, then exit without starting the
    /// event loop.
    #[arg(short = 'n')]
    check: bool,

    /// Enable verbose (info-level) logging.
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn parse_overrides(defines: &[String]) -> Result<Vec<(String, String)>, String> {
    defines
        .iter()
        .map(|d| {
            d.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("-D {d:?} is not of the form name=value"))
        })
        .collect()
}

fn init_logging(cli: &Cli) {
    let level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let overrides = match parse_overrides(&cli.define) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("batgw: {e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(&cli.config, &overrides) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("batgw: {e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.check {
        if let Err(e) = Gateway::check_config(&config) {
            eprintln!("batgw: {e}");
            return ExitCode::FAILURE;
        }
        println!("config OK");
        return ExitCode::SUCCESS;
    }

    let gateway = match Gateway::bootstrap(config) {
        Ok(g) => g,
        Err(e) => {
            log::error!("startup failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(gateway.run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("gateway aborted: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_overrides_splits_on_first_equals() {
        let overrides = parse_overrides(&["mqtt.port=1884".to_string(), "battery.ifname=can3".to_string()]).unwrap();
        assert_eq!(overrides[0], ("mqtt.port".to_string(), "1884".to_string()));
        assert_eq!(overrides[1], ("battery.ifname".to_string(), "can3".to_string()));
    }

    #[test]
    fn parse_overrides_rejects_missing_equals() {
        assert!(parse_overrides(&["not-a-kv-pair".to_string()]).is_err());
    }

    #[test]
    fn cli_parses_expected_flags() {
        let cli = Cli::parse_from(["batgw", "-d", "-v", "-n", "-f", "custom.toml", "-D", "a=b"]);
        assert!(cli.debug);
        assert!(cli.verbose);
        assert!(cli.check);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
        assert_eq!(cli.define, vec!["a=b".to_string()]);
    }
}
