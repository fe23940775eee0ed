// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XRCE agent binary.
//!
//! ```bash
//! # UDP on the standard port
//! xrce-agent udp4 2019
//!
//! # Serial device with discovery enabled
//! xrce-agent serial /dev/ttyUSB0 115200 --discovery
//!
//! # Several UARTs with hot-plug supervision
//! xrce-agent multiserial /dev/ttyUSB0 /dev/ttyUSB1
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use xrce_agent::protocol::Locator;
use xrce_agent::transport::Transport;
use xrce_agent::{
    AgentConfig, AgentContext, AgentDiscoverer, CedMiddleware, DiscoveryServer, Middleware,
    MiddlewareKind, MultiSerialTransport, SerialTransport, Server, TcpTransport, UdpTransport,
};

/// XRCE-DDS Agent - bridge XRCE clients into a DDS network.
#[derive(Parser, Debug)]
#[command(name = "xrce-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Middleware backend (ced = in-process broker).
    #[arg(short = 'm', long, default_value = "ced")]
    middleware: String,

    /// Enable the discovery responder, optionally on a custom port.
    #[arg(short = 'd', long, num_args = 0..=1, default_missing_value = "7400")]
    discovery: Option<u16>,

    /// Enable the P2P agent discoverer on the given local port.
    #[arg(short = 'p', long)]
    p2p_port: Option<u16>,

    /// References file handed to the middleware backend.
    #[arg(short = 'r', long)]
    refs: Option<String>,

    /// Verbosity, 0 (off) to 6 (trace). Overridden by
    /// XRCE_DDS_AGENT_LOG_LEVEL.
    #[arg(short = 'v', long, default_value = "4")]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve XRCE clients over UDP/IPv4.
    Udp4 {
        port: u16,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve XRCE clients over UDP/IPv6.
    Udp6 {
        port: u16,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve XRCE clients over TCP/IPv4.
    Tcp4 {
        port: u16,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve XRCE clients over TCP/IPv6.
    Tcp6 {
        port: u16,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve XRCE clients over a serial device.
    Serial {
        device: String,
        #[arg(default_value = "115200")]
        baud: u32,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve XRCE clients over several serial devices with supervision.
    Multiserial {
        #[arg(required = true)]
        devices: Vec<String>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Create a pseudo-terminal and serve XRCE clients over it.
    Pseudoterminal {
        #[command(flatten)]
        common: CommonArgs,
    },
}

impl Command {
    fn common(&self) -> &CommonArgs {
        match self {
            Command::Udp4 { common, .. }
            | Command::Udp6 { common, .. }
            | Command::Tcp4 { common, .. }
            | Command::Tcp6 { common, .. }
            | Command::Serial { common, .. }
            | Command::Multiserial { common, .. }
            | Command::Pseudoterminal { common } => common,
        }
    }
}

fn init_logging(verbose: u8) {
    // The environment wins over -v.
    let filter = match std::env::var("XRCE_DDS_AGENT_LOG_LEVEL") {
        Ok(value) => EnvFilter::new(value),
        Err(_) => {
            let level = match verbose {
                0 => None,
                1 => Some(Level::ERROR),
                2 => Some(Level::WARN),
                3 | 4 => Some(Level::INFO),
                5 => Some(Level::DEBUG),
                _ => Some(Level::TRACE),
            };
            match level {
                Some(level) => EnvFilter::new(format!("xrce_agent={level}")),
                None => EnvFilter::new("off"),
            }
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn build_context(common: &CommonArgs) -> Result<Arc<AgentContext>, String> {
    let kind = match common.middleware.as_str() {
        "ced" => MiddlewareKind::Ced,
        "dds" => MiddlewareKind::Dds,
        other => return Err(format!("unknown middleware kind '{other}'")),
    };
    let middleware: Arc<dyn Middleware> = match kind {
        MiddlewareKind::Ced => {
            if let Some(refs) = &common.refs {
                info!(refs = %refs, "references file ignored by the in-process broker");
            }
            Arc::new(CedMiddleware::new())
        }
        MiddlewareKind::Dds => {
            return Err(
                "no DDS backend compiled in; implement xrce_agent::Middleware and use the \
                 library API, or run with --middleware ced"
                    .to_string(),
            );
        }
    };
    let config = AgentConfig {
        middleware: kind,
        refs_path: common.refs.clone(),
        ..Default::default()
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(Arc::new(AgentContext::new(config, middleware)))
}

fn locator_for(addr: Option<SocketAddr>) -> Locator {
    match addr {
        Some(SocketAddr::V4(v4)) => Locator::Udp4 {
            addr: v4.ip().octets(),
            port: v4.port(),
        },
        Some(SocketAddr::V6(v6)) => Locator::Udp6 {
            addr: v6.ip().octets(),
            port: v6.port(),
        },
        None => Locator::None,
    }
}

/// Run a server until ctrl-c.
fn serve<T: Transport>(
    transport: Arc<T>,
    context: Arc<AgentContext>,
    advertised: Locator,
    common: &CommonArgs,
) -> i32 {
    let _discovery = match common.discovery {
        Some(port) => match DiscoveryServer::run(port, advertised) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!("discovery responder unavailable: {e}");
                None
            }
        },
        None => None,
    };
    let _discoverer = match common.p2p_port {
        Some(port) => match AgentDiscoverer::run(port) {
            Ok(discoverer) => Some(discoverer),
            Err(e) => {
                warn!("p2p discoverer unavailable: {e}");
                None
            }
        },
        None => None,
    };

    let server = Server::new(transport, context, advertised);
    if let Err(e) = server.run() {
        error!("server start failed: {e}");
        return 1;
    }

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        if let Err(e) = ctrlc_handler(move || stop.store(true, Ordering::Release)) {
            warn!("no signal handler, stop with SIGKILL: {e}");
        }
    }
    info!("agent running, press ctrl-c to stop");
    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(100));
    }
    server.stop();
    0
}

/// Minimal SIGINT hook without extra dependencies.
fn ctrlc_handler<F: Fn() + Send + Sync + 'static>(f: F) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::sync::OnceLock;
        static HANDLER: OnceLock<Box<dyn Fn() + Send + Sync>> = OnceLock::new();
        extern "C" fn trampoline(_sig: libc::c_int) {
            if let Some(f) = HANDLER.get() {
                f();
            }
        }
        HANDLER
            .set(Box::new(f))
            .map_err(|_| std::io::Error::other("handler already installed"))?;
        let handler = trampoline as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // SAFETY: trampoline is async-signal-safe: it only flips an atomic.
        unsafe {
            if libc::signal(libc::SIGINT, handler) == libc::SIG_ERR {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = f;
        Err(std::io::Error::other("unsupported platform"))
    }
}

fn main() {
    let cli = Cli::parse();
    let common = cli.command.common().clone();
    init_logging(common.verbose);

    let context = match build_context(&common) {
        Ok(context) => context,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Command::Udp4 { port, .. } => match UdpTransport::bind_v4(port) {
            Ok(t) => {
                let advertised = locator_for(t.local_addr().ok());
                serve(Arc::new(t), context, advertised, &common)
            }
            Err(e) => fatal_transport(e),
        },
        Command::Udp6 { port, .. } => match UdpTransport::bind_v6(port) {
            Ok(t) => {
                let advertised = locator_for(t.local_addr().ok());
                serve(Arc::new(t), context, advertised, &common)
            }
            Err(e) => fatal_transport(e),
        },
        Command::Tcp4 { port, .. } => match TcpTransport::bind_v4(port) {
            Ok(t) => {
                let advertised = locator_for(t.local_addr().ok());
                serve(Arc::new(t), context, advertised, &common)
            }
            Err(e) => fatal_transport(e),
        },
        Command::Tcp6 { port, .. } => match TcpTransport::bind_v6(port) {
            Ok(t) => {
                let advertised = locator_for(t.local_addr().ok());
                serve(Arc::new(t), context, advertised, &common)
            }
            Err(e) => fatal_transport(e),
        },
        Command::Serial { device, baud, .. } => match SerialTransport::open(&device, baud) {
            Ok(t) => serve(Arc::new(t), context, Locator::None, &common),
            Err(e) => fatal_transport(e),
        },
        Command::Multiserial { devices, .. } => {
            match MultiSerialTransport::open(devices, 115_200) {
                Ok(t) => serve(t, context, Locator::None, &common),
                Err(e) => fatal_transport(e),
            }
        }
        Command::Pseudoterminal { .. } => match SerialTransport::open_pty() {
            Ok(t) => {
                if let Some(path) = t.pty_path() {
                    // The one line users script against; keep it on stdout.
                    println!("{path}");
                }
                serve(Arc::new(t), context, Locator::None, &common)
            }
            Err(e) => fatal_transport(e),
        },
    };
    std::process::exit(code);
}

fn fatal_transport(e: xrce_agent::TransportError) -> i32 {
    error!("transport initialization failed: {e}");
    1
}
