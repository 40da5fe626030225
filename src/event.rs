// Typed-event plumbing. A state machine implements `OnEvent<M>` for its event
// type and is driven by a `Session<M>`: a single-threaded loop over an
// unbounded channel, so every handler runs to completion and compound state
// predicates are atomic without locks. Timers are a session service; they
// deliver ordinary events of the same type after a delay.

use std::{collections::HashMap, fmt::Debug, time::Duration};

use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

pub trait SendEvent<M> {
    fn send(&mut self, event: M) -> anyhow::Result<()>;
}

impl<N: Into<M>, M> SendEvent<N> for UnboundedSender<M> {
    fn send(&mut self, event: N) -> anyhow::Result<()> {
        UnboundedSender::send(self, event.into()).map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

// for wiring components whose upcalls nobody listens to
#[derive(Debug)]
pub struct Void;

impl<M> SendEvent<M> for Void {
    fn send(&mut self, _: M) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type TimerId = u32;

pub trait Timer<M> {
    fn set(&mut self, duration: Duration, event: M) -> anyhow::Result<TimerId>;

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()>;
}

pub trait OnEvent<M> {
    fn on_event(&mut self, event: M, timer: &mut impl Timer<M>) -> anyhow::Result<()>;
}

#[derive(Debug)]
enum SessionEvent<M> {
    Timer(TimerId, M),
    Other(M),
}

#[derive(Debug)]
pub struct SessionSender<M>(UnboundedSender<SessionEvent<M>>);

impl<M> Clone for SessionSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<N: Into<M>, M> SendEvent<N> for SessionSender<M> {
    fn send(&mut self, event: N) -> anyhow::Result<()> {
        self.0
            .send(SessionEvent::Other(event.into()))
            .map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

pub struct Session<M> {
    sender: UnboundedSender<SessionEvent<M>>,
    receiver: UnboundedReceiver<SessionEvent<M>>,
    timer_id: TimerId,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl<M> Debug for Session<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("timer_id", &self.timer_id)
            .finish_non_exhaustive()
    }
}

impl<M> Session<M> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self {
            sender,
            receiver,
            timer_id: 0,
            timers: Default::default(),
        }
    }

    pub fn sender(&self) -> SessionSender<M> {
        SessionSender(self.sender.clone())
    }
}

impl<M> Default for Session<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Session<M> {
    pub async fn run(&mut self, state: &mut impl OnEvent<M>) -> anyhow::Result<()>
    where
        M: Send + 'static,
    {
        loop {
            let event = match self
                .receiver
                .recv()
                .await
                .ok_or(anyhow::anyhow!("channel closed"))?
            {
                SessionEvent::Timer(timer_id, event) => {
                    // a timer may fire and enqueue its event before an unset
                    // lands; the map is the source of truth, a fired-but-unset
                    // timer is skipped here
                    if self.timers.remove(&timer_id).is_none() {
                        continue;
                    }
                    event
                }
                SessionEvent::Other(event) => event,
            };
            state.on_event(event, self)?
        }
    }
}

impl<M: Send + 'static> Timer<M> for Session<M> {
    fn set(&mut self, duration: Duration, event: M) -> anyhow::Result<TimerId> {
        self.timer_id += 1;
        let timer_id = self.timer_id;
        let sender = self.sender.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            sender.send(SessionEvent::Timer(timer_id, event)).ok();
        });
        self.timers.insert(timer_id, timer);
        Ok(timer_id)
    }

    fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()> {
        self.timers
            .remove(&timer_id)
            .ok_or(anyhow::anyhow!("timer not exists"))?
            .abort();
        Ok(())
    }
}
