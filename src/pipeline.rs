//! Capture, analysis and presentation threads.
//!
//! A capture thread pulls frames from a [`FrameSource`] into a single-slot channel, so at
//! most one frame waits while the worker analyzes the previous one. The worker owns the
//! [`Analyzer`] and sends a [`PipelineEvent`] per result back to the thread that started
//! the pipeline.

use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

use crate::analysis::{AnalysisResult, Analyzer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::inference::ModuleLoader;
use crate::preprocess::Frame;
use crate::webcam::FrameSource;

#[derive(Debug)]
pub enum PipelineEvent {
    Analyzed { index: usize, result: AnalysisResult },
    /// The analyzer latched; later frames are consumed but not analyzed.
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub sent: usize,
    pub dropped: usize,
}

pub struct Pipeline {
    capture: JoinHandle<Result<CaptureStats>>,
    worker: JoinHandle<Result<()>>,
    events: Receiver<PipelineEvent>,
}

impl Pipeline {
    /// Starts both threads. With `realtime`, frames that arrive while the slot is taken are
    /// dropped instead of blocking the source.
    pub fn start<S>(
        source: S,
        config: Config,
        loader: Box<dyn ModuleLoader + Send>,
        realtime: bool,
    ) -> Self
    where
        S: FrameSource + Send + 'static,
    {
        let (frame_tx, frame_rx) = mpsc::sync_channel::<(usize, Frame)>(1);
        let (event_tx, events) = mpsc::channel::<PipelineEvent>();

        let capture = spawn_capture(source, frame_tx, realtime);
        let worker = spawn_worker(config, loader, frame_rx, event_tx);

        Self {
            capture,
            worker,
            events,
        }
    }

    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    /// Stops listening for events and waits for both threads. The analyzer is closed
    /// before this returns, also when the caller stopped reading events early.
    pub fn finish(self) -> Result<CaptureStats> {
        let Pipeline {
            capture,
            worker,
            events,
        } = self;
        drop(events);

        let worker = worker
            .join()
            .map_err(|_| Error::ThreadPanicked("analysis"))?;
        let capture = capture
            .join()
            .map_err(|_| Error::ThreadPanicked("capture"))?;

        worker?;
        let stats = capture?;
        if stats.dropped > 0 {
            info!(dropped = stats.dropped, "frames dropped while analysis was busy");
        }
        Ok(stats)
    }
}

fn spawn_capture<S>(
    mut source: S,
    frame_tx: SyncSender<(usize, Frame)>,
    realtime: bool,
) -> JoinHandle<Result<CaptureStats>>
where
    S: FrameSource + Send + 'static,
{
    thread::spawn(move || {
        let mut stats = CaptureStats::default();
        let mut index = 0;

        while let Some(frame) = source.next_frame()? {
            if realtime {
                match frame_tx.try_send((index, frame)) {
                    Ok(()) => stats.sent += 1,
                    Err(TrySendError::Full(_)) => {
                        stats.dropped += 1;
                        debug!(index, "analysis busy, dropping frame");
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            } else if frame_tx.send((index, frame)).is_ok() {
                stats.sent += 1;
            } else {
                break;
            }
            index += 1;
        }

        debug!(sent = stats.sent, dropped = stats.dropped, "capture finished");
        Ok(stats)
    })
}

fn spawn_worker(
    config: Config,
    loader: Box<dyn ModuleLoader + Send>,
    frame_rx: Receiver<(usize, Frame)>,
    event_tx: Sender<PipelineEvent>,
) -> JoinHandle<Result<()>> {
    thread::spawn(move || {
        let rotation = config.camera.rotation;

        let error_tx = event_tx.clone();
        let mut analyzer = Analyzer::new(&config, loader)?.with_error_sink(Box::new(
            move |e: &Error| {
                let _ = error_tx.send(PipelineEvent::Failed(e.to_string()));
            },
        ));

        for (index, frame) in frame_rx {
            if let Some(result) = analyzer.analyze(&frame, rotation) {
                if event_tx.send(PipelineEvent::Analyzed { index, result }).is_err() {
                    debug!(index, "event receiver gone, stopping analysis");
                    break;
                }
            }
        }

        // the frame loop has ended, so no detection can be in flight here
        analyzer.close();
        Ok(())
    })
}
