//! Blink liveness detection.
//!
//! A session must produce one involuntary blink before matching jobs are
//! accepted. Eye openness is measured with the eye aspect ratio; a blink is
//! either an absolute dip below the closed-eye threshold or a relative drop
//! from the session's own baseline. The timeout clock starts on the first
//! frame containing a face and is checked on each new frame, not by a
//! background timer.

use crate::config::LivenessConfig;
use crate::face::{EyeLandmarks, EyePair};
use std::time::{Duration, Instant};

/// Eye aspect ratio for six landmarks p0..p5:
/// `(‖p1−p5‖ + ‖p2−p4‖) / (2·‖p0−p3‖)`.
/// A degenerate horizontal span yields 0.
pub fn eye_aspect_ratio(eye: &EyeLandmarks) -> f32 {
    let p = &eye.points;
    let a = point_distance(p[1], p[5]);
    let b = point_distance(p[2], p[4]);
    let c = point_distance(p[0], p[3]);
    if c == 0.0 {
        return 0.0;
    }
    (a + b) / (2.0 * c)
}

/// Mean aspect ratio across both eyes.
pub fn pair_aspect_ratio(pair: &EyePair) -> f32 {
    (eye_aspect_ratio(&pair.left) + eye_aspect_ratio(&pair.right)) / 2.0
}

fn point_distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessStatus {
    /// Waiting for a blink. Carries the whole seconds left on the clock.
    Pending { remaining_secs: u64 },
    /// Blink seen. State purged; the session may submit a job.
    BlinkConfirmed,
    /// Clock ran out. State purged; detection restarts on the next frame.
    TimedOut,
    /// No face in this frame. Clock untouched.
    NoFace,
}

/// Per-session blink state machine. One per connection, owned by its
/// handler and discarded with the connection.
pub struct BlinkDetector {
    config: LivenessConfig,
    baseline_ear: Option<f32>,
    baseline_frames: u32,
    last_ear: Option<f32>,
    closed_frames: u32,
    started_at: Option<Instant>,
}

impl BlinkDetector {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            baseline_ear: None,
            baseline_frames: 0,
            last_ear: None,
            closed_frames: 0,
            started_at: None,
        }
    }

    pub fn observe(&mut self, eyes: Option<&EyePair>) -> LivenessStatus {
        self.observe_at(Instant::now(), eyes)
    }

    pub fn observe_at(&mut self, now: Instant, eyes: Option<&EyePair>) -> LivenessStatus {
        let Some(pair) = eyes else {
            return LivenessStatus::NoFace;
        };

        let started = *self.started_at.get_or_insert(now);
        let elapsed = now.saturating_duration_since(started);
        let timeout = Duration::from_secs(self.config.timeout_secs);
        if elapsed > timeout {
            self.reset();
            return LivenessStatus::TimedOut;
        }

        let ear = pair_aspect_ratio(pair);

        // Establish the baseline while eyes are open, then keep adapting it
        // slowly so lighting drift does not defeat the relative-drop check.
        if ear > self.config.blink_threshold {
            if self.baseline_frames < self.config.baseline_frames {
                self.baseline_ear = Some(match self.baseline_ear {
                    None => ear,
                    Some(base) => {
                        (base * self.baseline_frames as f32 + ear)
                            / (self.baseline_frames + 1) as f32
                    }
                });
                self.baseline_frames += 1;
            } else if let Some(base) = self.baseline_ear {
                self.baseline_ear = Some(0.9 * base + 0.1 * ear);
            }
        }

        if ear > 0.0 {
            let mut blink = false;

            if ear < self.config.blink_threshold {
                self.closed_frames += 1;
                if self.closed_frames >= self.config.consec_frames {
                    blink = true;
                }
            }

            // Relative drop from baseline, gated on the previous frame being
            // open so a single noisy sample cannot fake a blink.
            if !blink {
                if let Some(base) = self.baseline_ear.filter(|b| *b > 0.0) {
                    let drop = (base - ear) / base;
                    if drop > self.config.drop_fraction
                        && self.last_ear.is_some_and(|last| last > self.config.blink_threshold)
                    {
                        blink = true;
                    }
                }
            }

            if blink {
                self.reset();
                return LivenessStatus::BlinkConfirmed;
            }

            if ear > self.config.blink_threshold {
                self.closed_frames = 0;
            }
            self.last_ear = Some(ear);
        }

        let remaining = timeout.saturating_sub(elapsed);
        LivenessStatus::Pending {
            remaining_secs: remaining.as_secs(),
        }
    }

    /// Drops all per-session accumulators. The clock restarts on the next
    /// frame containing a face.
    pub fn reset(&mut self) {
        self.baseline_ear = None;
        self.baseline_frames = 0;
        self.last_ear = None;
        self.closed_frames = 0;
        self.started_at = None;
    }
}
