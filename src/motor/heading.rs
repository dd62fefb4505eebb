// Heading latched from an external IMU publisher
//
// The runtime pushes samples as they arrive; the drive loop reads the latest
// one each tick. Samples older than the timeout count as a failed read.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{HardwareError, HeadingSensor};
use crate::geometry::Rotation2d;

#[derive(Debug, Default)]
struct Latch {
    sample: Option<(Rotation2d, Instant)>,
    zero: Rotation2d,
}

/// Cloneable handle: one clone feeds samples, another is handed to the drivetrain
#[derive(Debug, Clone)]
pub struct LatchedHeading {
    latch: Arc<Mutex<Latch>>,
    timeout: Duration,
}

impl LatchedHeading {
    pub fn new(timeout: Duration) -> Self {
        Self {
            latch: Arc::new(Mutex::new(Latch::default())),
            timeout,
        }
    }

    /// Record a raw sensor heading received at `at`
    pub fn push(&self, heading: Rotation2d, at: Instant) {
        self.latch.lock().sample = Some((heading, at));
    }

    /// Raw heading of the latched sample, if it is younger than the timeout
    fn fresh_sample(&self, latch: &Latch, now: Instant) -> Result<Rotation2d, HardwareError> {
        let (heading, at) = latch.sample.ok_or(HardwareError::NoHeading)?;
        let age = now.saturating_duration_since(at);
        if age > self.timeout {
            return Err(HardwareError::StaleHeading(age));
        }
        Ok(heading)
    }

    fn latest(&self, now: Instant) -> Result<Rotation2d, HardwareError> {
        let latch = self.latch.lock();
        Ok(self.fresh_sample(&latch, now)? - latch.zero)
    }

    fn zero_at(&self, now: Instant) -> Result<(), HardwareError> {
        let mut latch = self.latch.lock();
        latch.zero = self.fresh_sample(&latch, now)?;
        Ok(())
    }
}

impl HeadingSensor for LatchedHeading {
    fn read_heading(&mut self) -> Result<Rotation2d, HardwareError> {
        self.latest(Instant::now())
    }

    fn zero(&mut self) -> Result<(), HardwareError> {
        self.zero_at(Instant::now())
    }
}
