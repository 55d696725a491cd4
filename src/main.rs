use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshchat::{DecodeError, NeighbourAddr, Node, NodeEvent, MAX_DATA_PAYLOAD};

#[derive(Parser, Debug)]
#[command(name = "meshchat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address of a peer already in the overlay.
    bootstrap_ip: IpAddr,

    bootstrap_port: u16,

    #[arg(short, long, default_value = "[::]:0")]
    bind: SocketAddr,

    /// Prefix put in front of every line sent.
    #[arg(short, long, default_value = "anonymous", value_parser = parse_nickname)]
    name: String,
}

/// Longest nickname accepted, in bytes.
const MAX_NICKNAME_LEN: usize = 15;

/// Nicknames are 1 to 15 printable ASCII characters with no spaces.
fn parse_nickname(raw: &str) -> Result<String, String> {
    if raw.is_empty() {
        return Err("nickname must not be empty".to_string());
    }
    if raw.len() > MAX_NICKNAME_LEN {
        return Err(format!("nickname is longer than {} bytes", MAX_NICKNAME_LEN));
    }
    if !raw.bytes().all(|b| b.is_ascii_graphic()) {
        return Err("nickname must be printable characters without spaces".to_string());
    }
    Ok(raw.to_string())
}

fn warning_line(from: &NeighbourAddr, text: &str) -> String {
    format!("[warning from {}] {}", from, text)
}

fn invalid_message_line(from: &NeighbourAddr, error: &DecodeError) -> String {
    format!("[invalid message from {}] {}", from, error)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let node = Node::bind(&args.bind.to_string()).await?;
    info!(id = %node.local_id(), addr = %node.local_addr(), "Node started");

    let bootstrap = SocketAddr::new(args.bootstrap_ip, args.bootstrap_port);
    node.bootstrap(bootstrap)
        .await
        .with_context(|| format!("bootstrap to {} failed", bootstrap))?;

    let mut events = node.events().await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    // Graceful shutdown on Ctrl+C or end of input
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim_end();
                        if line.is_empty() {
                            continue;
                        }
                        let text = format!("{} : {}", args.name, line);
                        if text.len() > MAX_DATA_PAYLOAD {
                            warn!(len = text.len(), max = MAX_DATA_PAYLOAD, "line too long, not sent");
                            continue;
                        }
                        if let Err(e) = node.submit(text.as_bytes()).await {
                            warn!(error = %e, "submit failed");
                        }
                    }
                    Ok(None) => {
                        info!("Input closed, exiting");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to read input");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(NodeEvent::Text { text, .. }) => {
                        println!("{}", String::from_utf8_lossy(&text));
                    }
                    Some(NodeEvent::Warning { from, text }) => {
                        warn!(peer = %from, "warning: {}", text);
                        eprintln!("{}", warning_line(&from, &text));
                    }
                    Some(NodeEvent::GoAway { from, code, message }) => {
                        info!(peer = %from, code = code.as_u8(), "go away: {}", message);
                    }
                    Some(NodeEvent::InvalidMessage { from, error }) => {
                        warn!(peer = %from, error = %error, "invalid message");
                        eprintln!("{}", invalid_message_line(&from, &error));
                    }
                    None => break,
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nickname_rules() {
        assert_eq!(parse_nickname("alice").as_deref(), Ok("alice"));
        assert!(parse_nickname("fifteen_chars_x").is_ok());
        assert!(parse_nickname("").is_err());
        assert!(parse_nickname("two words").is_err());
        assert!(parse_nickname("sixteen_chars_xx").is_err());
        assert!(parse_nickname("tab\there").is_err());
        assert!(parse_nickname("caf\u{e9}").is_err());
    }

    #[test]
    fn console_notices_name_the_peer() {
        let from: NeighbourAddr = "127.0.0.1:1212".parse::<SocketAddr>().unwrap().into();
        assert_eq!(warning_line(&from, "slow down"), format!("[warning from {}] slow down", from));
        let line = invalid_message_line(&from, &DecodeError::BadMagic(7));
        assert!(line.starts_with(&format!("[invalid message from {}] ", from)));
    }

    #[test]
    fn args_reject_bad_nickname() {
        assert!(Args::try_parse_from(["meshchat", "::1", "1212", "--name", "a b"]).is_err());
        let args = Args::try_parse_from(["meshchat", "::1", "1212"]).unwrap();
        assert_eq!(args.name, "anonymous");
    }
}
