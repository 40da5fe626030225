// The print server is deliberately dumb: it accepts whatever arrives,
// whenever it arrives, and simulates the physical device with a bounded
// random delay per job. Serializing access is entirely the peers' problem;
// two jobs overlapping here means the mutual-exclusion layer is broken, not
// this one.

use std::time::Duration;

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::{
    clock::{LamportClock, Timestamp},
    console,
    event::{OnEvent, SendEvent, Timer},
    mutex::PeerId,
    net::{deserialize, Addr, SendMessage},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintRequest<A> {
    pub client_id: PeerId,
    pub client_addr: A,
    pub message_content: String,
    pub lamport_timestamp: Timestamp,
    pub request_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintResponse {
    pub success: bool,
    pub confirmation_message: String,
    pub lamport_timestamp: Timestamp,
}

#[derive(Debug)]
pub enum PrinterEvent<A> {
    Ingress(PrintRequest<A>),
    Done(PrintRequest<A>),
}

impl<A> From<PrintRequest<A>> for PrinterEvent<A> {
    fn from(request: PrintRequest<A>) -> Self {
        Self::Ingress(request)
    }
}

#[derive(Debug)]
pub struct Printer<N> {
    clock: LamportClock,
    delay_min: Duration,
    delay_max: Duration,
    net: N,
}

impl<N> Printer<N> {
    pub fn new(delay_min: Duration, delay_max: Duration, net: N) -> Self {
        Self {
            clock: LamportClock::new(0),
            delay_min,
            delay_max,
            net,
        }
    }
}

impl<N: SendMessage<A, PrintResponse>, A: Addr> OnEvent<PrinterEvent<A>> for Printer<N> {
    fn on_event(
        &mut self,
        event: PrinterEvent<A>,
        timer: &mut impl Timer<PrinterEvent<A>>,
    ) -> anyhow::Result<()> {
        match event {
            PrinterEvent::Ingress(request) => {
                self.clock.receive_event(request.lamport_timestamp);
                // the job line reads as if the client printed it: client
                // timestamp, client identity
                console::client_line(
                    request.client_id,
                    request.lamport_timestamp,
                    &request.message_content,
                );
                let delay = thread_rng().gen_range(self.delay_min..=self.delay_max);
                timer.set(delay, PrinterEvent::Done(request))?;
                Ok(())
            }
            PrinterEvent::Done(request) => {
                let timestamp = self.clock.tick();
                console::server_line(
                    timestamp,
                    format_args!("confirmation sent to client {}", request.client_id),
                );
                let response = PrintResponse {
                    success: true,
                    confirmation_message: format!(
                        "document #{} from client {} printed",
                        request.request_number, request.client_id
                    ),
                    lamport_timestamp: timestamp,
                };
                self.net.send(request.client_addr, response)
            }
        }
    }
}

pub fn on_buf<A: Addr + serde::de::DeserializeOwned>(
    buf: &[u8],
    sender: &mut impl SendEvent<PrintRequest<A>>,
) -> anyhow::Result<()> {
    sender.send(deserialize::<PrintRequest<A>>(buf)?)
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    use crate::event::TimerId;

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Replies(Rc<RefCell<Vec<(u32, PrintResponse)>>>);

    impl SendMessage<u32, PrintResponse> for Replies {
        fn send(&mut self, dest: u32, response: PrintResponse) -> anyhow::Result<()> {
            self.0.borrow_mut().push((dest, response));
            Ok(())
        }
    }

    #[derive(Debug, Default)]
    struct TestTimer {
        id: TimerId,
        armed: HashMap<TimerId, (Duration, PrinterEvent<u32>)>,
    }

    impl Timer<PrinterEvent<u32>> for TestTimer {
        fn set(&mut self, duration: Duration, event: PrinterEvent<u32>) -> anyhow::Result<TimerId> {
            self.id += 1;
            self.armed.insert(self.id, (duration, event));
            Ok(self.id)
        }

        fn unset(&mut self, timer_id: TimerId) -> anyhow::Result<()> {
            self.armed
                .remove(&timer_id)
                .map(|_| ())
                .ok_or(anyhow::anyhow!("timer not exists"))
        }
    }

    fn job(timestamp: Timestamp) -> PrintRequest<u32> {
        PrintRequest {
            client_id: 1,
            client_addr: 10,
            message_content: "document #1 from client 1".into(),
            lamport_timestamp: timestamp,
            request_number: 1,
        }
    }

    #[test]
    fn job_waits_out_the_simulated_delay_before_confirming() {
        let replies = Replies::default();
        let mut printer = Printer::new(
            Duration::from_millis(20),
            Duration::from_millis(30),
            replies.clone(),
        );
        let mut timer = TestTimer::default();
        printer
            .on_event(PrinterEvent::Ingress(job(5)), &mut timer)
            .unwrap();
        assert!(replies.0.borrow().is_empty());
        let (delay, pending) = timer.armed.remove(&1).unwrap();
        assert!(Duration::from_millis(20) <= delay && delay <= Duration::from_millis(30));

        printer.on_event(pending, &mut timer).unwrap();
        let replies = replies.0.borrow();
        let (dest, response) = &replies[0];
        assert_eq!(*dest, 10);
        assert!(response.success);
        // the confirmation is stamped after merging with the client's clock
        assert!(response.lamport_timestamp > 5);
    }

    #[test]
    fn concurrent_jobs_are_accepted_without_queueing() {
        let replies = Replies::default();
        let mut printer = Printer::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            replies.clone(),
        );
        let mut timer = TestTimer::default();
        printer
            .on_event(PrinterEvent::Ingress(job(5)), &mut timer)
            .unwrap();
        printer
            .on_event(PrinterEvent::Ingress(job(6)), &mut timer)
            .unwrap();
        // both jobs hold live delay timers at once
        assert_eq!(timer.armed.len(), 2);
    }
}
