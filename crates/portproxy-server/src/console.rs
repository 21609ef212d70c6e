//! Interactive console: one line in, one registry call out.

use crate::forward::MappingRegistry;
use portproxy_core::{MappingId, MappingRequest, Protocol, ProxyError, ProxyResult, Target};
use std::future::Future;
use std::io::{BufRead, Write};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::mpsc;
use tracing::debug;

const PROMPT: &str = "portproxy> ";

const HELP: &[&str] = &[
    "help - prints this help menu",
    "quit - quits this program",
    "mappings - prints all mappings",
    "unmap <id> - unmaps mapping with id. use \"mappings\" to get the id",
    "proxy [ip:]<port> <port> <protocol> - proxies ip:port through the second port.\n    ip defaults to 127.0.0.1, protocol is tcp, udp or both",
];

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Help,
    Quit,
    List,
    Unmap(MappingId),
    Proxy(MappingRequest),
}

/// What the console should do after a command ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Quit,
}

/// Parse one console line. Errors carry a user-facing message.
pub fn parse_command(line: &str) -> ProxyResult<Command> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(Command::Empty);
    };
    let args: Vec<&str> = words.collect();

    match command {
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        "mappings" => Ok(Command::List),
        "unmap" => match args.as_slice() {
            [] => Err(ProxyError::InvalidCommand("no id specified".to_string())),
            [id] => id
                .parse()
                .map(Command::Unmap)
                .map_err(|_| ProxyError::InvalidCommand(format!("invalid id: {id}"))),
            _ => Err(ProxyError::InvalidCommand(
                "usage: unmap <id>".to_string(),
            )),
        },
        "proxy" => {
            let [internal, external, protocol] = args.as_slice() else {
                return Err(ProxyError::InvalidCommand(
                    "usage: proxy [ip:]<port> <port> <protocol>".to_string(),
                ));
            };
            let (host, internal_port) = parse_internal(internal)?;
            let external_port = external
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidPort(format!("invalid external port: {external}")))?;
            let protocol = protocol.parse::<Protocol>()?;
            Ok(Command::Proxy(MappingRequest {
                protocol,
                external_port,
                target: Target::new(host.as_deref(), internal_port),
            }))
        }
        other => Err(ProxyError::InvalidCommand(format!("unknown command: {other}"))),
    }
}

/// Parse `[ip:]port`. IPv6 addresses are written `[addr]:port`.
fn parse_internal(arg: &str) -> ProxyResult<(Option<String>, u16)> {
    if let Ok(addr) = arg.parse::<SocketAddr>() {
        return Ok((Some(addr.ip().to_string()), nonzero_port(addr.port(), arg)?));
    }

    let (host, port) = match arg.rsplit_once(':') {
        Some(("", port)) => (None, port),
        Some((host, port)) => {
            let ip = host
                .parse::<IpAddr>()
                .map_err(|_| ProxyError::InvalidAddress(host.to_string()))?;
            (Some(ip.to_string()), port)
        }
        None => (None, arg),
    };
    let port = port
        .parse::<u16>()
        .map_err(|_| ProxyError::InvalidPort(format!("invalid source port: {port}")))?;
    Ok((host, nonzero_port(port, arg)?))
}

fn nonzero_port(port: u16, arg: &str) -> ProxyResult<u16> {
    if port == 0 {
        return Err(ProxyError::InvalidPort(format!("invalid source port: {arg}")));
    }
    Ok(port)
}

/// Run one command against the registry.
pub async fn execute(registry: &mut MappingRegistry, command: Command) -> Reply {
    match command {
        Command::Empty => Reply::Text(String::new()),
        Command::Quit => Reply::Quit,
        Command::Help => {
            let mut text = String::from("help menu:");
            for line in HELP {
                text.push_str("\n  ");
                text.push_str(line);
            }
            Reply::Text(text)
        }
        Command::List => {
            let mut text = String::from("active mappings:");
            for mapping in registry.list() {
                text.push_str(&format!("\n {mapping}"));
            }
            Reply::Text(text)
        }
        Command::Unmap(id) => match registry.remove(id).await {
            Ok(_) => Reply::Text(format!("terminated proxy with id {id}")),
            Err(ProxyError::MappingNotFound(_)) => Reply::Text("id not found".to_string()),
            Err(e) => Reply::Text(format!("unmap failed: {e}")),
        },
        Command::Proxy(request) => match registry.add(request).await {
            Ok(m) => Reply::Text(format!(
                "started proxy {} for {} on port {}",
                m.id, m.protocol, m.external_port
            )),
            Err(e) => Reply::Text(format!("proxy failed: {e}")),
        },
    }
}

/// Read commands from stdin until `quit`, end of input, or `shutdown` resolves.
pub async fn run<F>(registry: &mut MappingRegistry, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let mut lines = spawn_stdin_reader();
    tokio::pin!(shutdown);

    println!("type \"help\" for help, or \"quit\" to quit...");
    loop {
        print!("{PROMPT}");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = &mut shutdown => {
                println!();
                break;
            }
            line = lines.recv() => match line {
                Some(line) => line,
                None => {
                    debug!("console input closed");
                    break;
                }
            },
        };

        let reply = match parse_command(&line) {
            Ok(command) => execute(registry, command).await,
            Err(e) => Reply::Text(e.to_string()),
        };
        match reply {
            Reply::Quit => break,
            Reply::Text(text) if text.is_empty() => {}
            Reply::Text(text) => println!("{text}"),
        }
    }
    Ok(())
}

/// Forward stdin lines from a dedicated thread, so a pending read never
/// holds up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}
