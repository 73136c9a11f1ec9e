//! obfsclient binary.
//!
//! Usage: obfsclient [OPTIONS]
//!
//! Options:
//!   --debug        Enable debug logging
//!   --unsafe-logs  Log peer addresses without scrubbing
//!   --version      Print version information
//!   --help         Print usage

use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use obfsclient::obfs2::Obfs2Client;
use obfsclient::pt::PtClientConfig;
use obfsclient::socks::Socks5Server;
use obfsclient::ClientConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Signal-driven shutdown progression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shutdown {
    Running,
    ClosingListeners,
    ClosingSessions,
    Exiting,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut debug = false;
    let mut scrub_addrs = true;

    for arg in env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "--version" => {
                println!("obfsclient {}", VERSION);
                return Ok(());
            }
            "--debug" => debug = true,
            "--unsafe-logs" => scrub_addrs = false,
            other => {
                eprintln!("unknown option: {}", other);
                print_usage();
                process::exit(1);
            }
        }
    }

    // The host owns stdout, so nothing may be logged before the PT
    // bootstrap hands us a state directory to log into.
    let pt = match PtClientConfig::from_env() {
        Ok(pt) => pt,
        Err(e) => {
            eprintln!("PT bootstrap failed: {}", e);
            process::exit(-1);
        }
    };

    init_logging(pt.state_dir(), debug)?;
    tracing::info!("obfsclient {} initialized (pid {})", VERSION, process::id());

    let config = ClientConfig {
        scrub_addrs,
        ..ClientConfig::default()
    };

    // The transport table; further methods plug in here.
    let table = [Obfs2Client::descriptor()];

    let mut servers = Vec::new();
    for descriptor in table {
        let name = descriptor.name;
        if !pt.is_requested(name) {
            continue;
        }
        match Socks5Server::bind(descriptor, config.clone()).await {
            Ok(server) => {
                tracing::info!("SOCKSv5 listener: {} {}", server.addr(), name);
                pt.report_method(name, server.addr());
                let runner = server.clone();
                tokio::spawn(async move { runner.run().await });
                servers.push(server);
            }
            Err(e) => {
                tracing::error!("failed to set up a {} listener: {}", name, e);
                pt.report_error(name, &e.to_string());
            }
        }
    }
    pt.methods_done();

    if servers.is_empty() {
        tracing::info!("no supported transports requested, exiting");
        return Ok(());
    }

    tracing::info!("awaiting incoming connections");
    run_until_shutdown(&servers).await?;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Block until the operator has signalled three times: the first stops the
/// listeners, the second tears down live sessions, the third exits.
async fn run_until_shutdown(servers: &[Socks5Server]) -> anyhow::Result<()> {
    let mut state = Shutdown::Running;
    loop {
        tokio::signal::ctrl_c().await?;
        state = match state {
            Shutdown::Running => {
                tracing::info!("closing all listeners");
                for server in servers {
                    server.close();
                }
                Shutdown::ClosingListeners
            }
            Shutdown::ClosingListeners => {
                tracing::info!("closing all sessions");
                for server in servers {
                    server.close_sessions();
                }
                Shutdown::ClosingSessions
            }
            Shutdown::ClosingSessions | Shutdown::Exiting => Shutdown::Exiting,
        };
        if state == Shutdown::Exiting {
            break;
        }
    }
    Ok(())
}

fn init_logging(state_dir: &Path, debug: bool) -> anyhow::Result<()> {
    let log_file = std::fs::File::options()
        .create(true)
        .append(true)
        .open(state_dir.join("obfsclient.log"))?;

    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_target(false)
        .with_writer(Arc::new(log_file))
        .init();
    Ok(())
}

fn print_usage() {
    println!(
        r#"obfsclient - client-side pluggable transport proxy

USAGE:
    obfsclient [OPTIONS]

The process expects to be launched by a managed-transport host, which
supplies the configuration via TOR_PT_* environment variables.

OPTIONS:
    --debug          Enable debug logging
    --unsafe-logs    Log peer addresses without scrubbing
    --version        Print version information
    -h, --help       Print usage
"#
    );
}
