// Ricart-Agrawala mutual exclusion (Commun. ACM'81) over one-way messages.
// A peer that wants the printer broadcasts a timestamped request and may
// enter only after every other peer has granted. A peer receiving a request
// grants immediately unless its own use has priority, in which case it
// queues the requester and sends the withheld grant when it releases. The
// total order on (timestamp, peer id) makes the priority comparison
// unambiguous: no two peers can both see themselves in front.
//
// There is no request/response pairing on the wire. An immediate negative
// reply is a receipt (the responder is alive and has queued us), never
// permission; the grant proper is its own message. Silence is covered by the
// resend timer and is never mistaken for a grant.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    clock::{LamportClock, Timestamp},
    console,
    event::{OnEvent, SendEvent, Timer, TimerId},
    net::{deserialize, Addr, All, SendMessage},
    printer::{PrintRequest, PrintResponse},
};

pub type PeerId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest<A> {
    pub client_id: PeerId,
    pub client_addr: A,
    pub lamport_timestamp: Timestamp,
    pub request_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessResponse {
    pub client_id: PeerId,
    pub access_granted: bool,
    pub lamport_timestamp: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRelease {
    pub client_id: PeerId,
    pub lamport_timestamp: Timestamp,
    pub request_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
pub enum Message<A> {
    Request(AccessRequest<A>),
    Reply(AccessResponse),
    Release(AccessRelease),
    Print(PrintResponse),
}

pub mod events {
    #[derive(Debug, Clone)]
    pub struct Submit(pub String);

    #[derive(Debug, Clone)]
    pub struct StatusPoll;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Upcall {
        Entered { request_number: u64 },
        Released { request_number: u64, printed: bool },
    }
}

#[derive(Debug)]
pub enum PeerEvent<A> {
    Ingress(Message<A>),
    Submit(events::Submit),
    StatusPoll,
    ResendTimeout,
    PrintDeadline,
    RetryPrint,
}

impl<A> From<Message<A>> for PeerEvent<A> {
    fn from(message: Message<A>) -> Self {
        Self::Ingress(message)
    }
}

impl<A> From<events::Submit> for PeerEvent<A> {
    fn from(submit: events::Submit) -> Self {
        Self::Submit(submit)
    }
}

impl<A> From<events::StatusPoll> for PeerEvent<A> {
    fn from(events::StatusPoll: events::StatusPoll) -> Self {
        Self::StatusPoll
    }
}

pub trait PeerNet<A>: SendMessage<A, Message<A>> + SendMessage<All, Message<A>> {}
impl<T: SendMessage<A, Message<A>> + SendMessage<All, Message<A>>, A> PeerNet<A> for T {}

const RESEND_INTERVAL: Duration = Duration::from_secs(1);

const PRINT_DEADLINE: Duration = Duration::from_secs(10);

const MAX_PRINT_ATTEMPTS: u32 = 3;

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt).min(10))
}

#[derive(Debug, Clone)]
struct OwnRequest {
    lamport_timestamp: Timestamp,
    request_number: u64,
    content: String,
}

// the pending request lives inside the state it belongs to, so "holding
// without a request" cannot be represented
#[derive(Debug, Clone)]
enum Access {
    Idle,
    Waiting(OwnRequest),
    Held(OwnRequest),
}

#[derive(Debug)]
struct PrintAttempt<A> {
    request: PrintRequest<A>,
    attempt: u32,
    timer: TimerId,
}

#[derive(Debug)]
pub struct Peer<N, PN, U, A> {
    id: PeerId,
    addr: A,
    printer_addr: A,
    num_peers: usize,
    clock: LamportClock,
    access: Access,
    // deferred requests keyed by peer: a repeat from the same peer supersedes
    // its queued entry, so each peer gets at most one grant per episode
    deferred: BTreeMap<PeerId, AccessRequest<A>>,
    granted_by: BTreeSet<PeerId>,
    acknowledged: BTreeSet<PeerId>,
    request_number: u64,
    resend: Option<TimerId>,
    print: Option<PrintAttempt<A>>,

    net: N,
    printer_net: PN,
    upcall: U,
}

impl<N, PN, U, A> Peer<N, PN, U, A> {
    pub fn new(
        id: PeerId,
        addr: A,
        printer_addr: A,
        num_peers: usize,
        net: N,
        printer_net: PN,
        upcall: U,
    ) -> Self {
        Self {
            id,
            addr,
            printer_addr,
            num_peers,
            clock: LamportClock::new(0),
            access: Access::Idle,
            deferred: Default::default(),
            granted_by: Default::default(),
            acknowledged: Default::default(),
            request_number: 0,
            resend: None,
            print: None,
            net,
            printer_net,
            upcall,
        }
    }
}

impl<N: PeerNet<A>, PN: SendMessage<A, PrintRequest<A>>, U: SendEvent<events::Upcall>, A: Addr>
    OnEvent<PeerEvent<A>> for Peer<N, PN, U, A>
{
    fn on_event(
        &mut self,
        event: PeerEvent<A>,
        timer: &mut impl Timer<PeerEvent<A>>,
    ) -> anyhow::Result<()> {
        match event {
            PeerEvent::Ingress(Message::Request(request)) => self.on_request(request),
            PeerEvent::Ingress(Message::Reply(reply)) => self.on_reply(reply, timer),
            PeerEvent::Ingress(Message::Release(release)) => self.on_release(release),
            PeerEvent::Ingress(Message::Print(response)) => self.on_print_response(response, timer),
            PeerEvent::Submit(events::Submit(content)) => self.on_submit(content, timer),
            PeerEvent::StatusPoll => self.on_status(),
            PeerEvent::ResendTimeout => self.on_resend_timeout(timer),
            PeerEvent::PrintDeadline => self.on_print_deadline(timer),
            PeerEvent::RetryPrint => self.on_retry_print(timer),
        }
    }
}

impl<N: PeerNet<A>, PN: SendMessage<A, PrintRequest<A>>, U: SendEvent<events::Upcall>, A: Addr>
    Peer<N, PN, U, A>
{
    fn on_submit(
        &mut self,
        content: String,
        timer: &mut impl Timer<PeerEvent<A>>,
    ) -> anyhow::Result<()> {
        if !matches!(self.access, Access::Idle) {
            // at most one outstanding request per peer; late jobs are dropped
            console::client_line(
                self.id,
                self.clock.get(),
                format_args!("job dropped, a request is already in flight: {content}"),
            );
            return Ok(());
        }
        self.request_number += 1;
        let timestamp = self.clock.send_event();
        console::client_line(
            self.id,
            timestamp,
            format_args!(
                "requesting access to print (request #{}, TS: {timestamp})",
                self.request_number
            ),
        );
        let request = AccessRequest {
            client_id: self.id,
            client_addr: self.addr.clone(),
            lamport_timestamp: timestamp,
            request_number: self.request_number,
        };
        self.granted_by.clear();
        self.acknowledged.clear();
        self.access = Access::Waiting(OwnRequest {
            lamport_timestamp: timestamp,
            request_number: self.request_number,
            content,
        });
        self.net.send(All, Message::Request(request))?;
        self.resend = Some(timer.set(RESEND_INTERVAL, PeerEvent::ResendTimeout)?);
        // an empty roster needs no replies
        self.try_enter(timer)
    }

    fn on_request(&mut self, request: AccessRequest<A>) -> anyhow::Result<()> {
        let timestamp = self.clock.receive_event(request.lamport_timestamp);
        let (defer, why) = match &self.access {
            Access::Held(_) => (true, "we are in the critical section".to_string()),
            Access::Idle => (false, "we are idle".to_string()),
            Access::Waiting(own) => {
                match request.lamport_timestamp.cmp(&own.lamport_timestamp) {
                    Ordering::Less => (
                        false,
                        format!(
                            "TS {} < our TS {}",
                            request.lamport_timestamp, own.lamport_timestamp
                        ),
                    ),
                    Ordering::Greater => (
                        true,
                        format!(
                            "TS {} > our TS {}",
                            request.lamport_timestamp, own.lamport_timestamp
                        ),
                    ),
                    Ordering::Equal if request.client_id < self.id => (
                        false,
                        format!("TS tied, id {} < our id {}", request.client_id, self.id),
                    ),
                    Ordering::Equal => (
                        true,
                        format!("TS tied, id {} >= our id {}", request.client_id, self.id),
                    ),
                }
            }
        };
        let verdict = if defer { "deferred" } else { "granted" };
        console::client_line(
            self.id,
            timestamp,
            format_args!(
                "AccessRequest from client {} {verdict} ({why})",
                request.client_id
            ),
        );
        let reply = AccessResponse {
            client_id: self.id,
            access_granted: !defer,
            lamport_timestamp: self.clock.send_event(),
        };
        let requester = request.client_addr.clone();
        if defer {
            self.deferred.insert(request.client_id, request);
        }
        self.net.send(requester, Message::Reply(reply))
    }

    fn on_reply(
        &mut self,
        reply: AccessResponse,
        timer: &mut impl Timer<PeerEvent<A>>,
    ) -> anyhow::Result<()> {
        let timestamp = self.clock.receive_event(reply.lamport_timestamp);
        if !matches!(self.access, Access::Waiting(_)) {
            debug!(
                "reply from client {} outside of an open request",
                reply.client_id
            );
            return Ok(());
        }
        console::client_line(
            self.id,
            timestamp,
            format_args!(
                "reply received from client {} (granted: {})",
                reply.client_id, reply.access_granted
            ),
        );
        if reply.access_granted {
            self.acknowledged.remove(&reply.client_id);
            self.granted_by.insert(reply.client_id);
            self.try_enter(timer)
        } else {
            // a receipt: the responder is alive and has queued us behind its
            // own use; the grant arrives when it releases
            self.acknowledged.insert(reply.client_id);
            Ok(())
        }
    }

    fn on_release(&mut self, release: AccessRelease) -> anyhow::Result<()> {
        let timestamp = self.clock.receive_event(release.lamport_timestamp);
        console::client_line(
            self.id,
            timestamp,
            format_args!(
                "AccessRelease received from client {} (TS: {})",
                release.client_id, release.lamport_timestamp
            ),
        );
        // informational: the wakeup, if we are waiting, rides on the
        // deferred grant
        Ok(())
    }

    fn try_enter(&mut self, timer: &mut impl Timer<PeerEvent<A>>) -> anyhow::Result<()> {
        let Access::Waiting(own) = &self.access else {
            return Ok(());
        };
        if self.granted_by.len() < self.num_peers {
            return Ok(());
        }
        let own = own.clone();
        if let Some(resend) = self.resend.take() {
            timer.unset(resend)?
        }
        console::client_line(
            self.id,
            self.clock.get(),
            format_args!("access granted, all {} replies received", self.num_peers),
        );
        self.upcall.send(events::Upcall::Entered {
            request_number: own.request_number,
        })?;
        let request = PrintRequest {
            client_id: self.id,
            client_addr: self.addr.clone(),
            message_content: own.content.clone(),
            lamport_timestamp: self.clock.send_event(),
            request_number: own.request_number,
        };
        console::client_line(
            self.id,
            self.clock.get(),
            format_args!("sending document to printer: {}", request.message_content),
        );
        self.printer_net
            .send(self.printer_addr.clone(), request.clone())?;
        let deadline = timer.set(PRINT_DEADLINE, PeerEvent::PrintDeadline)?;
        self.print = Some(PrintAttempt {
            request,
            attempt: 1,
            timer: deadline,
        });
        self.access = Access::Held(own);
        Ok(())
    }

    fn on_print_response(
        &mut self,
        response: PrintResponse,
        timer: &mut impl Timer<PeerEvent<A>>,
    ) -> anyhow::Result<()> {
        self.clock.receive_event(response.lamport_timestamp);
        let Some(print) = self.print.take() else {
            debug!("print confirmation without an outstanding job");
            return Ok(());
        };
        timer.unset(print.timer)?;
        if response.success {
            console::client_line(
                self.id,
                self.clock.get(),
                format_args!("print confirmed: {}", response.confirmation_message),
            );
            self.release(true)
        } else {
            console::client_line(
                self.id,
                self.clock.get(),
                "print failed, the printer refused the job",
            );
            self.release(false)
        }
    }

    fn on_print_deadline(&mut self, timer: &mut impl Timer<PeerEvent<A>>) -> anyhow::Result<()> {
        let Some(print) = &mut self.print else {
            return Ok(());
        };
        // the clock advances once per attempt whether or not anything came
        // back
        self.clock.tick();
        if print.attempt >= MAX_PRINT_ATTEMPTS {
            console::client_line(
                self.id,
                self.clock.get(),
                format_args!(
                    "no confirmation from printer after {} attempt(s), giving up",
                    print.attempt
                ),
            );
            // the printer failing must not starve the other peers
            return self.release(false);
        }
        let wait = backoff(print.attempt);
        console::client_line(
            self.id,
            self.clock.get(),
            format_args!(
                "no confirmation from printer (attempt {}/{}), retrying in {:?}",
                print.attempt, MAX_PRINT_ATTEMPTS, wait
            ),
        );
        print.timer = timer.set(wait, PeerEvent::RetryPrint)?;
        Ok(())
    }

    fn on_retry_print(&mut self, timer: &mut impl Timer<PeerEvent<A>>) -> anyhow::Result<()> {
        let Some(print) = &mut self.print else {
            return Ok(());
        };
        print.attempt += 1;
        console::client_line(
            self.id,
            self.clock.get(),
            format_args!(
                "resending document to printer (attempt {}/{})",
                print.attempt, MAX_PRINT_ATTEMPTS
            ),
        );
        print.timer = timer.set(PRINT_DEADLINE, PeerEvent::PrintDeadline)?;
        let request = print.request.clone();
        self.printer_net.send(self.printer_addr.clone(), request)
    }

    fn release(&mut self, printed: bool) -> anyhow::Result<()> {
        let Access::Held(own) = &self.access else {
            warn!("release without holding access");
            return Ok(());
        };
        let own = own.clone();
        self.access = Access::Idle;
        self.print = None;
        let timestamp = self.clock.send_event();
        console::client_line(
            self.id,
            timestamp,
            format_args!(
                "releasing access, {} deferred grant(s) to send",
                self.deferred.len()
            ),
        );
        // grants go out before the release notice so a waiting peer never
        // sees a release for a request it has not been granted
        let mut deferred = std::mem::take(&mut self.deferred)
            .into_values()
            .collect::<Vec<_>>();
        deferred.sort_by_key(|request| (request.lamport_timestamp, request.client_id));
        for request in deferred {
            let reply = AccessResponse {
                client_id: self.id,
                access_granted: true,
                lamport_timestamp: self.clock.send_event(),
            };
            console::client_line(
                self.id,
                self.clock.get(),
                format_args!("sending deferred grant to client {}", request.client_id),
            );
            self.net.send(request.client_addr, Message::Reply(reply))?
        }
        self.net.send(
            All,
            Message::Release(AccessRelease {
                client_id: self.id,
                lamport_timestamp: timestamp,
                request_number: own.request_number,
            }),
        )?;
        self.granted_by.clear();
        self.acknowledged.clear();
        self.upcall.send(events::Upcall::Released {
            request_number: own.request_number,
            printed,
        })
    }

    fn on_resend_timeout(&mut self, timer: &mut impl Timer<PeerEvent<A>>) -> anyhow::Result<()> {
        let Access::Waiting(own) = &self.access else {
            self.resend = None;
            return Ok(());
        };
        console::client_line(
            self.id,
            self.clock.get(),
            format_args!(
                "waiting for replies ({}/{})",
                self.granted_by.len(),
                self.num_peers
            ),
        );
        let request = AccessRequest {
            client_id: self.id,
            client_addr: self.addr.clone(),
            lamport_timestamp: own.lamport_timestamp,
            request_number: own.request_number,
        };
        if self.granted_by.len() + self.acknowledged.len() < self.num_peers {
            // someone has neither granted nor queued us: the request (or the
            // peer) may be gone; superseding deferral keys make the duplicate
            // harmless wherever it does arrive
            self.net.send(All, Message::Request(request))?
        }
        self.resend = Some(timer.set(RESEND_INTERVAL, PeerEvent::ResendTimeout)?);
        Ok(())
    }

    fn on_status(&self) -> anyhow::Result<()> {
        let state = match &self.access {
            Access::Idle => "idle",
            Access::Waiting(_) => "waiting",
            Access::Held(_) => "held",
        };
        console::client_line(
            self.id,
            self.clock.get(),
            format_args!(
                "status - clock: {}, state: {state}, replies: {}/{}, deferred: {}",
                self.clock.get(),
                self.granted_by.len(),
                self.num_peers,
                self.deferred.len()
            ),
        );
        Ok(())
    }
}

pub fn on_buf<A: Addr + serde::de::DeserializeOwned>(
    buf: &[u8],
    sender: &mut impl SendEvent<Message<A>>,
) -> anyhow::Result<()> {
    sender.send(deserialize(buf)?)
}
