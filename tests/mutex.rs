// End-to-end over loopback TCP: a dumb printer and two full peers, each with
// its own event sessions and connection control, exactly as the binaries
// assemble them. Entry and release are observed through the upcall channel.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    net::TcpListener,
    sync::mpsc::{unbounded_channel, UnboundedSender},
    task::JoinSet,
    time::timeout,
};

use prelo::{
    event::{SendEvent, Session, SessionSender},
    mutex::{
        self,
        events::{Submit, Upcall},
        Message, Peer, PeerEvent, PeerId,
    },
    net::{
        session::{accept_session, Tcp, TcpControl},
        MessageNet, RosterNet,
    },
    printer::{self, PrintRequest, Printer},
};

struct Tagged(PeerId, UnboundedSender<(PeerId, Upcall)>);

impl SendEvent<Upcall> for Tagged {
    fn send(&mut self, event: Upcall) -> anyhow::Result<()> {
        self.1
            .send((self.0, event))
            .map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

async fn start_printer(tasks: &mut JoinSet<anyhow::Result<()>>) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr = listener.local_addr()?;
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
        Duration::from_millis(10),
        Duration::from_millis(20),
        MessageNet::<_, Message<SocketAddr>>::new(Tcp(net_session.sender())),
    );
    tasks.spawn(accept_session(listener, net_session.sender()));
    tasks.spawn(async move { net_session.run(&mut control).await });
    tasks.spawn(async move { printer_session.run(&mut printer).await });
    Ok(addr)
}

#[allow(clippy::too_many_arguments)]
async fn start_peer(
    tasks: &mut JoinSet<anyhow::Result<()>>,
    id: PeerId,
    listener: TcpListener,
    addr: SocketAddr,
    printer_addr: SocketAddr,
    peers: Vec<SocketAddr>,
    upcall: UnboundedSender<(PeerId, Upcall)>,
) -> anyhow::Result<SessionSender<PeerEvent<SocketAddr>>> {
    let mut peer_session = Session::new();
    let mut net_session = Session::new();
    let sender = peer_session.sender();
    let mut control = TcpControl::new(
        {
            let mut sender = peer_session.sender();
            move |buf: &[u8]| mutex::on_buf::<SocketAddr>(buf, &mut sender)
        },
        addr,
    );
    let mut peer = Peer::new(
        id,
        addr,
        printer_addr,
        peers.len(),
        RosterNet::new(
            MessageNet::<_, Message<SocketAddr>>::new(Tcp(net_session.sender())),
            peers,
        ),
        MessageNet::<_, PrintRequest<SocketAddr>>::new(Tcp(net_session.sender())),
        Tagged(id, upcall),
    );
    tasks.spawn(accept_session(listener, net_session.sender()));
    tasks.spawn(async move { net_session.run(&mut control).await });
    tasks.spawn(async move { peer_session.run(&mut peer).await });
    Ok(sender)
}

#[tokio::test(flavor = "multi_thread")]
async fn single_job_prints_and_releases() -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();
    let (upcall, mut upcalls) = unbounded_channel();
    let printer_addr = start_printer(&mut tasks).await?;
    let listener1 = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let listener2 = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr1 = listener1.local_addr()?;
    let addr2 = listener2.local_addr()?;
    let mut sender1 = start_peer(
        &mut tasks,
        1,
        listener1,
        addr1,
        printer_addr,
        vec![addr2],
        upcall.clone(),
    )
    .await?;
    let _sender2 = start_peer(
        &mut tasks,
        2,
        listener2,
        addr2,
        printer_addr,
        vec![addr1],
        upcall,
    )
    .await?;

    sender1.send(Submit("one off".into()))?;
    let entered = timeout(Duration::from_secs(10), upcalls.recv()).await?.unwrap();
    assert_eq!(entered, (1, Upcall::Entered { request_number: 1 }));
    let released = timeout(Duration::from_secs(10), upcalls.recv()).await?.unwrap();
    assert_eq!(
        released,
        (
            1,
            Upcall::Released {
                request_number: 1,
                printed: true
            }
        )
    );
    tasks.abort_all();
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn contending_peers_hold_one_at_a_time() -> anyhow::Result<()> {
    let mut tasks = JoinSet::new();
    let (upcall, mut upcalls) = unbounded_channel();
    let printer_addr = start_printer(&mut tasks).await?;
    let listener1 = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let listener2 = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
    let addr1 = listener1.local_addr()?;
    let addr2 = listener2.local_addr()?;
    let mut sender1 = start_peer(
        &mut tasks,
        1,
        listener1,
        addr1,
        printer_addr,
        vec![addr2],
        upcall.clone(),
    )
    .await?;
    let mut sender2 = start_peer(
        &mut tasks,
        2,
        listener2,
        addr2,
        printer_addr,
        vec![addr1],
        upcall,
    )
    .await?;

    sender1.send(Submit("from one".into()))?;
    sender2.send(Submit("from two".into()))?;

    let mut events = Vec::new();
    while events.len() < 4 {
        events.push(
            timeout(Duration::from_secs(10), upcalls.recv())
                .await?
                .unwrap(),
        )
    }
    // strict alternation: whoever enters releases before the other enters
    let (first, first_event) = &events[0];
    assert!(matches!(first_event, Upcall::Entered { .. }));
    assert_eq!(events[1].0, *first);
    assert!(matches!(events[1].1, Upcall::Released { printed: true, .. }));
    let (second, second_event) = &events[2];
    assert_ne!(second, first);
    assert!(matches!(second_event, Upcall::Entered { .. }));
    assert_eq!(events[3].0, *second);
    assert!(matches!(events[3].1, Upcall::Released { printed: true, .. }));
    tasks.abort_all();
    Ok(())
}
