use std::{future::Future, time::Duration};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::health::Liveness;
use crate::modbus::{transport, RegisterMap, RegisterReader};
use crate::mqtt::{Broker, Link, Publisher};
use crate::sampler::{Sampler, Status};

/// The poll loop. Owns the sampler (and through it the serial link) and the publisher, so neither needs locking.
pub struct Scheduler<R, L> {
    sampler: Sampler<R>,
    publisher: Publisher<L>,
    period: Duration,
    liveness: Liveness,
}

impl<R: RegisterReader, L: Link> Scheduler<R, L> {
    pub fn new(
        sampler: Sampler<R>,
        publisher: Publisher<L>,
        period: Duration,
        liveness: Liveness,
    ) -> Self {
        Self {
            sampler,
            publisher,
            period,
            liveness,
        }
    }

    #[cfg(test)]
    pub(crate) fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    #[cfg(test)]
    pub(crate) fn publisher(&self) -> &Publisher<L> {
        &self.publisher
    }

    /// Run cycles on a fixed grid until `shutdown` resolves. Shutdown is only observed between cycles.
    pub async fn run(&mut self, shutdown: impl Future) {
        let mut interval = tokio::time::interval(self.period);
        // An overrunning cycle is followed by one immediate tick, then we return to the grid
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                _ = interval.tick() => {}
            }
            self.cycle().await;
        }

        self.publisher.close().await;
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn cycle(&mut self) {
        let reading = self.sampler.sample().await;

        let present = reading.present_count();
        match reading.status() {
            Status::Complete => debug!(values = present, "Read meter"),
            Status::Partial => {
                let missing: Vec<&str> = reading.absent().map(|(name, _)| name).collect();
                warn!(values = present, ?missing, "Partial reading");
            }
            Status::Failed => warn!("No values read from meter"),
        }

        let published = self.publisher.publish(&reading).await;
        debug!(published, "Cycle finished");

        if present > 0 {
            self.liveness.record_success().await;
        }
    }
}

/// Open the serial port, then poll the meter and publish until `shutdown` resolves.
pub async fn run(config: Config, shutdown: impl Future) -> crate::Result<()> {
    config.validate()?;

    let map = RegisterMap::dtsu666();
    let publisher = Publisher::new(Broker::new(&config.mqtt), &config.mqtt, &map)?;
    let transport = transport::open(&config.device)?;
    let sampler = Sampler::new(transport, map);

    info!(
        port = %config.device.serial_port,
        slave = config.device.slave_id,
        broker = %config.mqtt.host,
        prefix = %config.mqtt.topic_prefix,
        interval = ?config.device.poll_interval,
        "Starting up"
    );

    let mut scheduler = Scheduler::new(
        sampler,
        publisher,
        config.device.poll_interval,
        Liveness::new(config.heartbeat_file),
    );
    scheduler.run(shutdown).await;

    Ok(())
}
