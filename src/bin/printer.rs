use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use prelo::{
    event::Session,
    mutex::Message,
    net::{
        session::{accept_session, Tcp, TcpControl},
        MessageNet,
    },
    printer::{self, Printer},
};

#[derive(Debug, Parser)]
#[command(about = "dumb print server; accepts jobs serially but enforces nothing")]
struct Cli {
    #[arg(long, default_value_t = 50051)]
    port: u16,

    #[arg(long, default_value_t = 2.0)]
    delay_min: f64,

    #[arg(long, default_value_t = 3.0)]
    delay_max: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt::init();
    anyhow::ensure!(
        cli.delay_min >= 0. && cli.delay_max >= 0.,
        "print delays must be non-negative"
    );
    anyhow::ensure!(
        cli.delay_min <= cli.delay_max,
        "--delay-min must not exceed --delay-max"
    );

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], cli.port))).await?;

    let mut printer_session = Session::new();
    let mut net_session = Session::new();
    let mut control = TcpControl::new(
        {
            let mut sender = printer_session.sender();
            move |buf: &[u8]| printer::on_buf::<SocketAddr>(buf, &mut sender)
        },
        None,
    );
    let mut printer = Printer::new(
        Duration::from_secs_f64(cli.delay_min),
        Duration::from_secs_f64(cli.delay_max),
        MessageNet::<_, Message<SocketAddr>>::new(Tcp(net_session.sender())),
    );

    info!(
        port = cli.port,
        delay_min = cli.delay_min,
        delay_max = cli.delay_max,
        "print server started"
    );

    let tcp_accept_session = accept_session(listener, net_session.sender());
    let net_session = net_session.run(&mut control);
    let printer_session = printer_session.run(&mut printer);

    tokio::select! {
        result = tcp_accept_session => result?,
        result = net_session => result?,
        result = printer_session => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("shutting down");
            return Ok(());
        }
    }
    anyhow::bail!("unreachable")
}
