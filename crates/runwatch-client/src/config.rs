use anyhow::{bail, Context, Result};
use clap::Parser;
use std::env;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8082/command";
pub const DEFAULT_LOG_DIR: &str = ".runwatch/logs";

#[derive(Parser, Debug)]
#[command(name = "runwatch", about = "Live dashboard for a remote test runner")]
pub struct Args {
    /// Websocket endpoint of the runner's command channel.
    #[arg(long, default_value = "")]
    pub url: String,
    /// Run every test after each full discovery.
    #[arg(long, default_value_t = false)]
    pub auto_run: bool,
    /// Open a fresh session whenever the channel closes.
    #[arg(long, default_value_t = false)]
    pub reconnect: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub endpoint: Url,
    pub auto_run: bool,
    pub reconnect: bool,
    pub log_dir: String,
    pub log_stdout: bool,
}

pub fn load_config(args: Args) -> Result<RuntimeConfig> {
    Ok(RuntimeConfig {
        endpoint: resolve_endpoint(&args.url, env::var("RUNWATCH_URL").ok())?,
        auto_run: resolve_switch(args.auto_run, "RUNWATCH_AUTO_RUN"),
        reconnect: resolve_switch(args.reconnect, "RUNWATCH_RECONNECT"),
        log_dir: resolve_log_dir(&args.log_dir),
        log_stdout: env::var("RUNWATCH_LOG_STDOUT")
            .ok()
            .and_then(|value| parse_bool_env(&value))
            .unwrap_or(false),
    })
}

fn resolve_endpoint(flag: &str, env_value: Option<String>) -> Result<Url> {
    let raw = if !flag.trim().is_empty() {
        flag.trim().to_string()
    } else {
        env_value
            .filter(|value| !value.trim().is_empty())
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string())
    };
    let url = Url::parse(&raw).with_context(|| format!("invalid endpoint url: {raw}"))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => bail!("endpoint must use ws or wss, got {other}: {raw}"),
    }
}

fn resolve_switch(flag: bool, key: &str) -> bool {
    if flag {
        return true;
    }
    env::var(key)
        .ok()
        .and_then(|value| parse_bool_env(&value))
        .unwrap_or(false)
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = env::var("RUNWATCH_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_LOG_DIR.to_string()
}

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
