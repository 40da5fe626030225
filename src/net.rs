// Message-level networking. `SendMessage` is a one-way, unreliable interface:
// a returned `Ok` promises nothing about delivery, only that the message was
// handed to the transport. Reliability belongs to the protocol layer
// (resend timers, backoff), not here.

use std::{fmt::Debug, marker::PhantomData, net::SocketAddr};

use bincode::Options;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

pub mod session;

pub trait Addr: Debug + Clone + Send + Sync + 'static {}
impl<T: Debug + Clone + Send + Sync + 'static> Addr for T {}

pub trait SendMessage<A, M> {
    fn send(&mut self, dest: A, message: M) -> anyhow::Result<()>;
}

/// Destination standing for every peer on the configured roster.
#[derive(Debug, Clone, Copy)]
pub struct All;

pub fn serialize<M: Serialize>(message: &M) -> anyhow::Result<Bytes> {
    Ok(bincode::options().serialize(message)?.into())
}

pub fn deserialize<M: DeserializeOwned>(buf: &[u8]) -> anyhow::Result<M> {
    bincode::options()
        .allow_trailing_bytes()
        .deserialize(buf)
        .map_err(Into::into)
}

/// Encodes typed messages into wire frames before handing them to a raw
/// buffer transport. `M` is the wire type; anything convertible into it can
/// be sent, which lets protocol code send bare record types while the wire
/// carries the enveloping enum.
#[derive(Debug)]
pub struct MessageNet<N, M>(pub N, PhantomData<M>);

impl<N, M> MessageNet<N, M> {
    pub fn new(net: N) -> Self {
        Self(net, Default::default())
    }
}

impl<N: SendMessage<A, Bytes>, A, M: Serialize, I: Into<M>> SendMessage<A, I>
    for MessageNet<N, M>
{
    fn send(&mut self, dest: A, message: I) -> anyhow::Result<()> {
        self.0.send(dest, serialize(&message.into())?)
    }
}

/// Fans `All` out over the peer addresses configured at startup; unicast
/// destinations pass straight through.
#[derive(Debug)]
pub struct RosterNet<N> {
    net: N,
    peers: Vec<SocketAddr>,
}

impl<N> RosterNet<N> {
    pub fn new(net: N, peers: Vec<SocketAddr>) -> Self {
        Self { net, peers }
    }
}

impl<N: SendMessage<SocketAddr, M>, M> SendMessage<SocketAddr, M> for RosterNet<N> {
    fn send(&mut self, dest: SocketAddr, message: M) -> anyhow::Result<()> {
        self.net.send(dest, message)
    }
}

impl<N: SendMessage<SocketAddr, M>, M: Clone> SendMessage<All, M> for RosterNet<N> {
    fn send(&mut self, All: All, message: M) -> anyhow::Result<()> {
        for &addr in &self.peers {
            self.net.send(addr, message.clone())?
        }
        Ok(())
    }
}
