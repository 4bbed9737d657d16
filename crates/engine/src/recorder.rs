//! Per-response turn recorder with tail-silence detection.
//!
//! One recorder runs per in-flight response. It drains the remote audio tap,
//! polls RMS amplitude on a fixed cadence, and stops once sustained quiet
//! follows detected voice, or at the hard length cap. The finished clip is
//! resampled to the clip rate and written to the clip store keyed by the
//! message id.

use crate::audio::{self, AudioFrame};
use crate::clips::{AudioClip, ClipMeta, ClipStore};
use crate::config::RecorderTunables;
use crate::transcript::TranscriptAggregator;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle to a running recorder task.
pub struct RecorderHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl RecorderHandle {
    /// Signals the recorder to finalize now and waits for the clip write.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Starts capturing the tap for `message_id`.
pub fn spawn(
    message_id: Uuid,
    tap: broadcast::Receiver<AudioFrame>,
    clips: Arc<dyn ClipStore>,
    transcript: Arc<TranscriptAggregator>,
    cfg: RecorderTunables,
) -> RecorderHandle {
    let (stop_tx, stop_rx) = oneshot::channel();
    let task = tokio::spawn(run(message_id, tap, clips, transcript, cfg, stop_rx));
    RecorderHandle {
        stop_tx: Some(stop_tx),
        task,
    }
}

async fn run(
    message_id: Uuid,
    mut tap: broadcast::Receiver<AudioFrame>,
    clips: Arc<dyn ClipStore>,
    transcript: Arc<TranscriptAggregator>,
    cfg: RecorderTunables,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let started = Instant::now();
    let min_active = Duration::from_millis(cfg.min_active_ms);
    let quiet = Duration::from_millis(cfg.quiet_ms);
    let max = Duration::from_millis(cfg.max_ms);

    let mut poll = tokio::time::interval(Duration::from_millis(cfg.poll_interval_ms));
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut samples: Vec<f32> = Vec::new();
    let mut tap_rate: u32 = cfg.clip_sample_rate;
    let mut current_rms: f32 = 0.0;

    // Start of the current uninterrupted voice streak; cleared by quiet
    // samples until the streak reaches min_active and arms tail tracking.
    let mut voiced_since: Option<Instant> = None;
    let mut armed = false;
    let mut last_loud: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                debug!(%message_id, "recorder stopped externally");
                break;
            }
            result = tap.recv() => match result {
                Ok(frame) => {
                    tap_rate = frame.sample_rate;
                    current_rms = audio::rms(&frame.samples);
                    samples.extend_from_slice(&frame.samples);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%message_id, skipped, "recorder lagged behind the audio tap");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(%message_id, "audio tap closed");
                    break;
                }
            },
            _ = poll.tick() => {
                let now = Instant::now();
                if now.duration_since(started) >= max {
                    debug!(%message_id, "recorder hit the hard length cap");
                    break;
                }
                if current_rms >= cfg.arm_threshold {
                    let since = *voiced_since.get_or_insert(now);
                    last_loud = Some(now);
                    if !armed && now.duration_since(since) >= min_active {
                        armed = true;
                    }
                } else if !armed {
                    voiced_since = None;
                }
                if armed {
                    if let Some(loud) = last_loud {
                        if now.duration_since(loud) >= quiet {
                            debug!(%message_id, "tail silence detected");
                            break;
                        }
                    }
                }
            }
        }
    }

    finalize(message_id, samples, tap_rate, clips, transcript, &cfg).await;
}

async fn finalize(
    message_id: Uuid,
    samples: Vec<f32>,
    tap_rate: u32,
    clips: Arc<dyn ClipStore>,
    transcript: Arc<TranscriptAggregator>,
    cfg: &RecorderTunables,
) {
    if samples.is_empty() {
        debug!(%message_id, "recorder captured no audio");
        return;
    }
    let duration_ms = samples.len() as u64 * 1000 / tap_rate.max(1) as u64;
    let resampled = match audio::resample(&samples, tap_rate, cfg.clip_sample_rate) {
        Ok(resampled) => resampled,
        Err(e) => {
            warn!(%message_id, error = ?e, "clip resampling failed, storing at tap rate");
            samples
        }
    };
    let blob: Bytes = audio::pcm16_bytes(&resampled);
    let clip = AudioClip::new(
        message_id,
        blob,
        ClipMeta {
            sample_rate: cfg.clip_sample_rate,
            channels: 1,
            duration_ms,
        },
    );
    match clips.put(clip).await {
        Ok(()) => transcript.mark_audio(message_id).await,
        // Replay simply stays unavailable for this message.
        Err(e) => warn!(%message_id, error = %e, "clip store rejected recording"),
    }
}
