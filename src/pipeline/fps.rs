use std::time::{Duration, Instant};

/// Ceiling for the instantaneous rate; also what two frames at the same
/// instant report.
pub const MAX_FPS: f64 = 1000.0;

/// `1/Δt` clamped to `0..=MAX_FPS`. Never NaN or infinite.
pub fn instantaneous_fps(elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return MAX_FPS;
    }
    (1.0 / secs).min(MAX_FPS)
}

/// Frame rate between consecutive processed frames.
#[derive(Debug, Default)]
pub struct FpsCounter {
    last: Option<Instant>,
    fps: f64,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame at `now`. The first tick reports 0.
    pub fn tick(&mut self, now: Instant) -> f64 {
        if let Some(last) = self.last {
            self.fps = instantaneous_fps(now.saturating_duration_since(last));
        }
        self.last = Some(now);
        self.fps
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}
