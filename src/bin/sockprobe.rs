use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sockwrap::logging::init_logging;
use sockwrap::net::{
    self, Family, HostAddr, PeerAddr, ProxySettings, RecvOutcome, ResolvedAddr,
    SocketConfig, SocketHandle,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "sockprobe")]
#[command(about = "Exercise socket handles: resolve, connect, listen and broadcast")]
struct Args {
    /// JSON socket configuration file
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a host name
    Resolve {
        host: String,
        #[arg(long)]
        ipv6: bool,
        /// Print every candidate instead of the first
        #[arg(long)]
        all: bool,
    },
    /// Connect, optionally send a message, and print what comes back
    Connect {
        host: String,
        port: u16,
        #[arg(long)]
        ipv6: bool,
        /// Proxy URL such as socks5://127.0.0.1:1080; overrides the config file
        #[arg(long)]
        proxy: Option<ProxySettings>,
        #[arg(long)]
        message: Option<String>,
    },
    /// Listen and echo every connection back to its sender
    Listen {
        port: u16,
        #[arg(long)]
        ipv6: bool,
        /// Ask for an external port mapping
        #[arg(long)]
        upnp: bool,
        /// Stop after the first connection
        #[arg(long)]
        once: bool,
    },
    /// Send one broadcast datagram
    Broadcast { port: u16, message: String },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json).context("Failed to install logger")?;

    let config = match &args.config {
        Some(path) => SocketConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path))?,
        None => SocketConfig::default(),
    };

    if !net::initialize() {
        bail!("socket subsystem unavailable");
    }
    let result = run(args.command, config);
    net::shutdown();
    result
}

fn run(command: Command, config: SocketConfig) -> Result<()> {
    match command {
        Command::Resolve { host, ipv6, all } => {
            let resolved = ResolvedAddr::new(&HostAddr::new(host.as_str(), 0, ipv6, false), all);
            if !resolved.is_valid() {
                bail!("could not resolve {}", host);
            }
            for peer in &resolved {
                println!("{}", peer.ip());
            }
        }
        Command::Connect {
            host,
            port,
            ipv6,
            proxy,
            message,
        } => {
            let proxy = proxy.unwrap_or_else(|| config.proxy.clone());
            let mut socket = SocketHandle::new().with_config(config);
            socket
                .connect(&host, port, ipv6, &proxy)
                .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
            let peer = socket.peer_ip()?;
            info!(peer = %peer, "connected");

            if let Some(message) = message {
                socket.send_all(message.as_bytes())?;
            }
            let mut buf = [0u8; 4096];
            loop {
                match socket.recv(&mut buf, true)? {
                    RecvOutcome::Data(n) => print!("{}", String::from_utf8_lossy(&buf[..n])),
                    RecvOutcome::Closed => break,
                    RecvOutcome::WouldBlock => continue,
                }
            }
        }
        Command::Listen {
            port,
            ipv6,
            upnp,
            once,
        } => {
            let mut listener = SocketHandle::new().with_config(config);
            listener.listen(port, ipv6, upnp)?;
            println!(
                "listening on port {} (external port {})",
                listener.local_port()?,
                listener.upnp_port()
            );

            loop {
                let conn = listener.accept()?;
                let peer = conn.peer_ip()?;
                info!(peer = %peer, "accepted");
                echo(&conn)?;
                if once {
                    break;
                }
            }
        }
        Command::Broadcast { port, message } => {
            let mut socket = SocketHandle::new();
            socket.create(Family::V4, true)?;
            let sent = socket.send_to(message.as_bytes(), &PeerAddr::broadcast(port))?;
            println!("sent {} bytes to {}", sent, PeerAddr::broadcast(port));
        }
    }
    Ok(())
}

fn echo(conn: &SocketHandle) -> Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        match conn.recv(&mut buf, true)? {
            RecvOutcome::Data(n) => conn.send_all(&buf[..n])?,
            RecvOutcome::Closed => return Ok(()),
            RecvOutcome::WouldBlock => continue,
        }
    }
}
