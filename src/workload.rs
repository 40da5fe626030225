// Drivers that feed the peer state machine from outside: a generator that
// submits a fresh print job at a random interval, and a reporter that polls
// for a status line. Both are plain loops; whether a job is honored or
// dropped is the state machine's call, not theirs.

use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    event::SendEvent,
    mutex::{
        events::{StatusPoll, Submit},
        PeerId,
    },
};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

pub async fn generate_session(
    id: PeerId,
    interval_min: Duration,
    interval_max: Duration,
    mut sender: impl SendEvent<Submit>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let mut job_number = 0u64;
    loop {
        let interval = thread_rng().gen_range(interval_min..=interval_max);
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = sleep(interval) => {}
        }
        job_number += 1;
        sender.send(Submit(format!("document #{job_number} from client {id}")))?
    }
}

pub async fn status_session(
    mut sender: impl SendEvent<StatusPoll>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = sleep(STATUS_INTERVAL) => {}
        }
        sender.send(StatusPoll)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Collect(Vec<String>);

    impl SendEvent<Submit> for &mut Collect {
        fn send(&mut self, Submit(content): Submit) -> anyhow::Result<()> {
            self.0.push(content);
            Ok(())
        }
    }

    #[tokio::test]
    async fn jobs_are_numbered_and_stop_on_shutdown() {
        let mut collect = Collect::default();
        let shutdown = CancellationToken::new();
        let session = generate_session(
            7,
            Duration::from_millis(1),
            Duration::from_millis(2),
            &mut collect,
            shutdown.clone(),
        );
        let cancel = async {
            sleep(Duration::from_millis(50)).await;
            shutdown.cancel();
            anyhow::Ok(())
        };
        tokio::try_join!(session, cancel).unwrap();
        assert!(!collect.0.is_empty());
        assert_eq!(collect.0[0], "document #1 from client 7");
        for (index, content) in collect.0.iter().enumerate() {
            assert_eq!(*content, format!("document #{} from client 7", index + 1));
        }
    }
}
