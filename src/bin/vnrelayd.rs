//! vnrelayd: the relay daemon.
//!
//! Loads a config file, brings up the overlay boundary, starts the
//! communication layer, and drives the scripting boundary from a
//! line-oriented command loop on stdin:
//!
//!   send <node-id-hex> <text…>
//!   recv <node-id-hex>
//!   quit
//!
//! Usage:
//!   vnrelayd -c /path/to/vnrelay.conf [-p <port>]

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::info;

use vnrelay::comm::CommLayer;
use vnrelay::config;
use vnrelay::overlay::{Overlay, SystemOverlay};
use vnrelay::relay::DEFAULT_PORT;
use vnrelay::script::{Bridge, SendReply};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let (config_path, port_override) = parse_args(&args);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(&config_path, port_override) {
        eprintln!("fatal: {}", e);
        std::process::exit(1);
    }
}

fn parse_args(args: &[String]) -> (String, Option<u16>) {
    let mut config_path = None;
    let mut port = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" if i + 1 < args.len() => {
                config_path = Some(args[i + 1].clone());
                i += 2;
            }
            "-p" if i + 1 < args.len() => {
                match args[i + 1].parse() {
                    Ok(p) => port = Some(p),
                    Err(_) => usage(),
                }
                i += 2;
            }
            _ => usage(),
        }
    }
    match config_path {
        Some(path) => (path, port),
        None => usage(),
    }
}

fn usage() -> ! {
    eprintln!("Usage: vnrelayd -c <vnrelay.conf> [-p <port>]");
    std::process::exit(1);
}

fn parse_node_id(token: &str) -> Option<i64> {
    let digits = token.strip_prefix("0x").unwrap_or(token);
    u64::from_str_radix(digits, 16).ok().map(|id| id as i64)
}

fn run(cfg_path: &str, port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    info!("loading config: {}", cfg_path);
    let cfg = config::load(cfg_path)?;
    let network_id = cfg.network_id()?;
    let node_id = cfg.node_id()?;
    let port = port_override.or(cfg.port()?).unwrap_or(DEFAULT_PORT);

    let overlay = SystemOverlay::new(network_id, node_id);

    // Log readiness notifications as the overlay reports them.
    let events = overlay.subscribe();
    thread::spawn(move || {
        for event in events {
            info!("overlay: {:?}", event);
        }
    });

    overlay.wait_ready(Duration::from_secs(30))?;
    let comm = CommLayer::new(overlay, network_id, port)?;
    info!("relay up: network {:016x}, port {}", network_id, port);
    let bridge = Bridge::new(Arc::new(comm));

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("send") => {
                let node_id = match tokens.next().and_then(parse_node_id) {
                    Some(id) => id,
                    None => {
                        writeln!(stdout, "send: expected a hex node id")?;
                        continue;
                    }
                };
                let text = tokens.collect::<Vec<_>>().join(" ");
                match bridge.send(node_id, &text) {
                    SendReply::Sent(n) => writeln!(stdout, "sent {} bytes", n)?,
                    SendReply::Failed { code, message } => {
                        writeln!(stdout, "error {}: {}", code, message)?
                    }
                }
            }
            Some("recv") => {
                let node_id = match tokens.next().and_then(parse_node_id) {
                    Some(id) => id,
                    None => {
                        writeln!(stdout, "recv: expected a hex node id")?;
                        continue;
                    }
                };
                let (len, payload) = bridge.receive(node_id);
                if len == 0 {
                    writeln!(stdout, "no message")?;
                } else {
                    writeln!(stdout, "{} bytes: {}", len, payload)?;
                }
            }
            Some("quit") => break,
            Some(other) => writeln!(stdout, "unknown command {:?}", other)?,
            None => continue,
        }
    }

    // Dropping the CommLayer inside the bridge joins the relay threads.
    Ok(())
}
