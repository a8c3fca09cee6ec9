use crate::channel::ChannelConfig;
use crate::reading::{FieldSlot, Reading, ReadingError};
use crate::uploader::{UploadOutcome, Uploader};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Produces one reading per call.
pub trait SensorSource: Send {
    fn sample(&mut self) -> Result<Reading, ReadingError>;
}

const TEMPERATURE_RANGE: Range<f64> = 20.0..30.0;
const HUMIDITY_RANGE: Range<f64> = 40.0..60.0;
const PRESSURE_RANGE: Range<f64> = 980.0..1020.0;
const AIR_QUALITY_RANGE: Range<f64> = 50.0..150.0;

/// Random readings in the ranges of the bench deployment, rounded to two
/// decimals.
pub struct SimulatedSensor {
    rng: StdRng,
}

impl SimulatedSensor {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn draw(&mut self, range: Range<f64>) -> f64 {
        (self.rng.gen_range(range) * 100.0).round() / 100.0
    }
}

impl SensorSource for SimulatedSensor {
    fn sample(&mut self) -> Result<Reading, ReadingError> {
        let fields = [
            (FieldSlot::Temperature, self.draw(TEMPERATURE_RANGE)),
            (FieldSlot::Humidity, self.draw(HUMIDITY_RANGE)),
            (FieldSlot::Pressure, self.draw(PRESSURE_RANGE)),
            (FieldSlot::AirQuality, self.draw(AIR_QUALITY_RANGE)),
        ];
        Reading::new(fields)
    }
}

/// Samples `source` every `interval` and uploads each reading until
/// cancelled. The uploader's interval guard may stretch a cycle; missed
/// sampling ticks are skipped rather than bunched up.
pub fn spawn_upload_loop<S>(
    mut source: S,
    uploader: Uploader,
    config: ChannelConfig,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: SensorSource + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reading = match source.sample() {
                        Ok(reading) => reading.restricted_to(&config.field_map),
                        Err(err) => {
                            tracing::warn!(error = %err, "sensor produced an invalid reading");
                            continue;
                        }
                    };
                    tracing::debug!(reading = %reading, "sampled");
                    if let UploadOutcome::Succeeded { entry_id, .. } =
                        uploader.upload(&config, &reading).await
                    {
                        tracing::debug!(entry_id, "sample stored");
                    }
                }
            }
        }
        tracing::info!(channel = %config.channel_id, "upload loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::test_support::{test_channel_config, StubChannel};
    use std::sync::Arc;

    fn in_range(value: Option<f64>, range: Range<f64>) -> bool {
        value.is_some_and(|v| range.contains(&v) || v == range.end)
    }

    #[test]
    fn simulated_values_stay_in_range_with_two_decimals() {
        let mut sensor = SimulatedSensor::seeded(42);
        for _ in 0..500 {
            let reading = sensor.sample().unwrap();
            assert!(in_range(reading.get(FieldSlot::Temperature), TEMPERATURE_RANGE));
            assert!(in_range(reading.get(FieldSlot::Humidity), HUMIDITY_RANGE));
            assert!(in_range(reading.get(FieldSlot::Pressure), PRESSURE_RANGE));
            assert!(in_range(reading.get(FieldSlot::AirQuality), AIR_QUALITY_RANGE));
            for (_, value) in reading.populated() {
                let cents = value * 100.0;
                assert!((cents - cents.round()).abs() < 1e-6, "{value} has more than two decimals");
            }
        }
    }

    #[test]
    fn seeded_sensors_are_reproducible() {
        let a: Vec<_> = {
            let mut sensor = SimulatedSensor::seeded(9);
            (0..5).map(|_| sensor.sample().unwrap().get(FieldSlot::Pressure)).collect()
        };
        let b: Vec<_> = {
            let mut sensor = SimulatedSensor::seeded(9);
            (0..5).map(|_| sensor.sample().unwrap().get(FieldSlot::Pressure)).collect()
        };
        assert_eq!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_loop_respects_interval_and_stops_on_cancel() {
        let stub = Arc::new(StubChannel::new());
        let uploader = Uploader::new(stub.clone(), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let handle = spawn_upload_loop(
            SimulatedSensor::seeded(1),
            uploader,
            test_channel_config(),
            Duration::from_secs(15),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(46)).await;
        let calls = stub.write_calls();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(15));
        }

        cancel.cancel();
        handle.await.expect("upload loop task");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(stub.stored(), 4);
    }
}
