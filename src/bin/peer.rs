use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use prelo::{
    event::{Session, Void},
    mutex::{self, Message, Peer},
    net::{
        session::{accept_session, Tcp, TcpControl},
        MessageNet, RosterNet,
    },
    printer::PrintRequest,
    workload,
};

#[derive(Debug, Parser)]
#[command(about = "peer node of the distributed print spool")]
struct Cli {
    /// Unique positive identifier of this peer.
    #[arg(long)]
    id: u32,

    /// Port this peer listens on for protocol messages.
    #[arg(long)]
    port: u16,

    /// host:port of the print server.
    #[arg(long)]
    server: String,

    /// Comma-separated host:port list of the other peers, possibly empty.
    #[arg(long, default_value = "")]
    clients: String,

    #[arg(long, default_value_t = 5.0)]
    job_interval_min: f64,

    #[arg(long, default_value_t = 10.0)]
    job_interval_max: f64,

    /// Host under which the other peers and the printer can reach us.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

async fn resolve(host_port: &str) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host(host_port)
        .await?
        .next()
        .ok_or(anyhow::anyhow!("cannot resolve {host_port}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt::init();
    anyhow::ensure!(cli.id >= 1, "peer id must be positive");
    anyhow::ensure!(
        cli.job_interval_min >= 0. && cli.job_interval_max >= 0.,
        "job intervals must be non-negative"
    );
    anyhow::ensure!(
        cli.job_interval_min <= cli.job_interval_max,
        "--job-interval-min must not exceed --job-interval-max"
    );

    let printer_addr = resolve(&cli.server).await?;
    let mut peer_addrs = Vec::new();
    for peer in cli
        .clients
        .split(',')
        .map(str::trim)
        .filter(|addr| !addr.is_empty())
    {
        peer_addrs.push(resolve(peer).await?)
    }
    let addr = resolve(&format!("{}:{}", cli.host, cli.port)).await?;
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], cli.port))).await?;

    let mut peer_session = Session::new();
    let mut net_session = Session::new();
    let mut control = TcpControl::new(
        {
            let mut sender = peer_session.sender();
            move |buf: &[u8]| mutex::on_buf::<SocketAddr>(buf, &mut sender)
        },
        addr,
    );
    let mut peer = Peer::new(
        cli.id,
        addr,
        printer_addr,
        peer_addrs.len(),
        RosterNet::new(
            MessageNet::<_, Message<SocketAddr>>::new(Tcp(net_session.sender())),
            peer_addrs.clone(),
        ),
        MessageNet::<_, PrintRequest<SocketAddr>>::new(Tcp(net_session.sender())),
        Void,
    );

    info!(
        id = cli.id,
        port = cli.port,
        printer = %cli.server,
        peers = peer_addrs.len(),
        "peer started"
    );

    let shutdown = CancellationToken::new();
    let tcp_accept_session = accept_session(listener, net_session.sender());
    let generate_session = workload::generate_session(
        cli.id,
        Duration::from_secs_f64(cli.job_interval_min),
        Duration::from_secs_f64(cli.job_interval_max),
        peer_session.sender(),
        shutdown.clone(),
    );
    let status_session = workload::status_session(peer_session.sender(), shutdown.clone());
    let net_session = net_session.run(&mut control);
    let peer_session = peer_session.run(&mut peer);

    tokio::select! {
        result = tcp_accept_session => result?,
        result = generate_session => result?,
        result = status_session => result?,
        result = net_session => result?,
        result = peer_session => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            shutdown.cancel();
            info!("shutting down");
            return Ok(());
        }
    }
    anyhow::bail!("unreachable")
}
