use chrono::{DateTime, Utc};

/// Wall-clock elapsed timer for a generation in flight. Anchored at
/// submission time, or reconstructed from the job's `created_at` when the
/// precise start was not recorded. One-second display resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedClock {
    anchor: DateTime<Utc>,
}

impl ElapsedClock {
    pub fn start() -> Self {
        Self { anchor: Utc::now() }
    }

    pub fn from_created_at(created_at: DateTime<Utc>) -> Self {
        Self { anchor: created_at }
    }

    pub fn seconds(&self) -> u64 {
        self.seconds_at(Utc::now())
    }

    pub fn seconds_at(&self, now: DateTime<Utc>) -> u64 {
        (now - self.anchor).num_seconds().max(0) as u64
    }

    /// Live `mm:ss` display string.
    pub fn clock_display(&self) -> String {
        format_clock(self.seconds())
    }

    /// Snapshot taken once at the terminal transition. The live ticker can
    /// be reset afterwards without disturbing this value.
    pub fn finalize(&self) -> FinalDuration {
        FinalDuration::from_seconds(self.seconds())
    }

    pub fn finalize_at(&self, now: DateTime<Utc>) -> FinalDuration {
        FinalDuration::from_seconds(self.seconds_at(now))
    }
}

/// Recorded duration of a finished generation, for historical display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalDuration {
    pub seconds: u64,
    pub display: String,
}

impl FinalDuration {
    pub fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds,
            display: humanize_duration(seconds),
        }
    }
}

pub fn format_clock(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

pub fn humanize_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s")
    } else {
        format!("{}m {}s", seconds / 60, seconds % 60)
    }
}
