use std::fmt::Display;

use chrono::{DateTime, Utc};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Frame I/O statistics of a link.
///
/// Frame size mean and variance are computed from deviations from the first frame's size,
/// which keeps the sums small for a stream of similarly sized frames.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkStats {
    pub first_io: Option<DateTime<Utc>>,
    pub last_io: Option<DateTime<Utc>>,
    pub total_bytes: usize,
    pub total_frames: usize,
    pub first_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    sum_dev: f64,
    sum_sq_dev: f64,
}

impl LinkStats {
    /// Record a frame of `size` bytes at the current time.
    pub fn add(&mut self, size: usize) {
        self.add_at(size, Utc::now());
    }

    pub(crate) fn add_at(&mut self, size: usize, when: DateTime<Utc>) {
        if self.total_frames == 0 {
            self.first_io = Some(when);
            self.first_size = size;
            self.min_size = size;
            self.max_size = size;
        }
        self.last_io = Some(when);
        self.total_frames += 1;
        self.total_bytes += size;
        self.min_size = self.min_size.min(size);
        self.max_size = self.max_size.max(size);

        let dev = size as f64 - self.first_size as f64;
        self.sum_dev += dev;
        self.sum_sq_dev += dev * dev;
    }

    /// Mean frame size; 0 if there were no frames.
    #[must_use]
    pub fn mean_size(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.first_size as f64 + self.sum_dev / self.total_frames as f64
    }

    /// Sample variance of the frame size; 0 with fewer than 2 frames.
    #[must_use]
    pub fn size_variance(&self) -> f64 {
        if self.total_frames < 2 {
            return 0.0;
        }
        let n = self.total_frames as f64;
        (self.sum_sq_dev - self.sum_dev * self.sum_dev / n) / (n - 1.0)
    }

    /// Seconds between the first and last I/O.
    #[must_use]
    pub fn duration(&self) -> f64 {
        match (self.first_io, self.last_io) {
            (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    /// Bytes per second over [LinkStats::duration]; 0 if the duration is 0.
    #[must_use]
    pub fn byte_rate(&self) -> f64 {
        let secs = self.duration();
        if secs > 0.0 {
            self.total_bytes as f64 / secs
        } else {
            0.0
        }
    }
}

impl Display for LinkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "frames:        {}", self.total_frames)?;
        writeln!(f, "bytes:         {}", self.total_bytes)?;
        writeln!(f, "duration:      {:.3} s", self.duration())?;
        writeln!(f, "byte rate:     {:.1} B/s", self.byte_rate())?;
        writeln!(f, "first size:    {}", self.first_size)?;
        writeln!(f, "smallest size: {}", self.min_size)?;
        writeln!(f, "largest size:  {}", self.max_size)?;
        writeln!(f, "mean size:     {:.1}", self.mean_size())?;
        write!(f, "size stddev:   {:.1}", self.size_variance().sqrt())
    }
}
