//! burrow-server: the server end of a covert TCP-over-DNS tunnel.
//!
//! ```text
//! burrow-server --gen-key [--privkey-file PATH] [--pubkey-file PATH]
//! burrow-server --udp ADDR [--privkey-file PATH | --privkey HEX] DOMAIN UPSTREAMADDR
//! ```

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::net::UdpSocket;

use burrow::config::{ServerConfig, IDLE_TIMEOUT};
use burrow::dns::Name;
use burrow::{keys, Carrier, QueuePacketConn, SessionFabric};

#[derive(Parser)]
#[command(
    name = "burrow-server",
    version,
    about = "Covert TCP-over-DNS tunnel server",
    long_about = "Serves a TCP tunnel to clients that reach it through \
                  recursive DNS resolvers. Upstream data arrives in TXT query \
                  names under DOMAIN; downstream data leaves in TXT answers. \
                  Each tunnelled stream is connected to UPSTREAMADDR."
)]
struct Cli {
    /// Generate a server keypair; print to stdout or save to files
    #[arg(long)]
    gen_key: bool,

    /// UDP address to listen on (required for serving)
    #[arg(long, value_name = "ADDR")]
    udp: Option<String>,

    /// Server private key as hex digits
    #[arg(long, value_name = "HEX")]
    privkey: Option<String>,

    /// Read the server private key from a file (with --gen-key, write it there)
    #[arg(long, value_name = "PATH")]
    privkey_file: Option<PathBuf>,

    /// With --gen-key, write the server public key to a file
    #[arg(long, value_name = "PATH")]
    pubkey_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// DOMAIN UPSTREAMADDR
    #[arg(value_name = "ARG")]
    args: Vec<String>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            exit(1);
        }
    };

    let level = match cli.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    if cli.gen_key {
        if !cli.args.is_empty() || cli.privkey.is_some() || cli.udp.is_some() {
            eprintln!("--gen-key does not take positional arguments, --privkey, or --udp");
            exit(1);
        }
        if let Err(e) = keys::generate_key_files(
            cli.privkey_file.as_deref(),
            cli.pubkey_file.as_deref(),
        ) {
            eprintln!("cannot generate keypair: {:#}", e);
            exit(1);
        }
        return;
    }

    let config = match server_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("cannot start runtime: {}", e);
            exit(1);
        }
    };
    if let Err(e) = runtime.block_on(serve(config)) {
        log::error!("{:#}", e);
        exit(1);
    }
}

fn server_config(cli: &Cli) -> Result<ServerConfig> {
    anyhow::ensure!(
        cli.args.len() == 2,
        "expected exactly two arguments, DOMAIN and UPSTREAMADDR"
    );
    anyhow::ensure!(
        cli.pubkey_file.is_none(),
        "--pubkey-file may only be used with --gen-key"
    );

    let domain = Name::parse(&cli.args[0])
        .with_context(|| format!("invalid domain {:?}", cli.args[0]))?;
    let upstream_addr = resolve(&cli.args[1])
        .with_context(|| format!("cannot resolve {:?}", cli.args[1]))?;
    let udp = cli
        .udp
        .as_deref()
        .context("the --udp listen address is required")?;
    let udp_addr = resolve(udp).with_context(|| format!("invalid --udp address {:?}", udp))?;

    let privkey = match (&cli.privkey_file, &cli.privkey) {
        (Some(_), Some(_)) => {
            anyhow::bail!("only one of --privkey and --privkey-file may be used")
        }
        (Some(path), None) => keys::read_key_file(path).context("cannot read privkey file")?,
        (None, Some(hex)) => keys::decode_key(hex).context("privkey format error")?,
        (None, None) => {
            warn!("generating a temporary one-time keypair");
            warn!("use --privkey or --privkey-file for a persistent server keypair");
            keys::generate_keypair()?.private
        }
    };

    let config = ServerConfig {
        udp_addr,
        domain,
        upstream_addr,
        privkey,
    };
    config.validate()?;
    Ok(config)
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .context("no addresses found")
}

async fn serve(config: ServerConfig) -> Result<()> {
    let pubkey = keys::pubkey_from_privkey(&config.privkey)?;
    info!("pubkey {}", hex::encode(pubkey));

    let socket = UdpSocket::bind(config.udp_addr)
        .await
        .context("opening UDP listener")?;
    info!("listening on {}", socket.local_addr()?);

    let conn = QueuePacketConn::new(2 * IDLE_TIMEOUT);
    let fabric = SessionFabric::new(
        Arc::clone(&conn),
        config.privkey.clone(),
        config.upstream_addr,
    );
    tokio::spawn(async move {
        if let Err(e) = fabric.run().await {
            log::error!("session fabric: {:#}", e);
        }
    });

    Carrier::new(socket, config.domain, conn).run().await
}
