use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::trace;

use crate::sfu::Sfu;

const MIN_TICK: Duration = Duration::from_micros(100);

/// Drives the pacing and RTCP ticks of an [`Sfu`].
///
/// The ticks only hold a weak reference, so dropping the last `Arc<Sfu>`
/// stops them as well.
#[derive(Debug)]
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(sfu: &Arc<Sfu>) -> Self {
        let config = sfu.config();
        let pacing = spawn_tick(Arc::downgrade(sfu), config.pacing_interval, |sfu| async move {
            let now = sfu.clock().now_ns();
            sfu.pace(now).await;
        });
        let rtcp = spawn_tick(Arc::downgrade(sfu), config.rtcp_interval, |sfu| async move {
            let now = sfu.clock().now_ns();
            sfu.send_reports(now).await;
        });
        Self {
            tasks: vec![pacing, rtcp],
        }
    }

    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_tick<F, Fut>(sfu: Weak<Sfu>, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<Sfu>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(MIN_TICK));
        // a slow tick must not cause a burst of catch-up ticks
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(sfu) = sfu.upgrade() else {
                trace!("sfu dropped, stopping tick");
                break;
            };
            tick(sfu).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfigBuilder;

    #[tokio::test]
    async fn ticks_stop_when_the_sfu_is_dropped() {
        let config = SfuConfigBuilder::new()
            .pacing(Duration::from_millis(1), 2)
            .rtcp_interval(Duration::from_millis(5))
            .build();
        let (sfu, _rx) = Sfu::new(config);
        let scheduler = Scheduler::start(&sfu);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(scheduler.tasks.iter().all(|t| !t.is_finished()));

        drop(sfu);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.tasks.iter().all(|t| t.is_finished()));
    }
}
