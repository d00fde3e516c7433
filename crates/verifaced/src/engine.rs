use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use veriface_core::collector::{CollectMode, CollectionResult, FrameCollector};
use veriface_core::types::{
    AnalyzerError, DepthSensor, Detection, FaceAnalyzer, FrameSample, SensorError,
};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error(transparent)]
    Analyzer(#[from] AnalyzerError),
    #[error("a capture session is already active")]
    Busy,
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Parameters for one collection session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSpec {
    pub mode: CollectMode,
    /// Hard wall-clock cap, enforced in both modes.
    pub max_duration: Duration,
    pub live_ratio_threshold: f32,
    pub liveness_threshold_mm: f32,
}

/// Everything one session produced: the aggregate plus the raw samples whose
/// embeddings feed identity matching.
pub struct SessionOutcome {
    pub summary: CollectionResult,
    pub samples: Vec<FrameSample>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Collect {
        spec: SessionSpec,
        reply: oneshot::Sender<Result<SessionOutcome, EngineError>>,
    },
    Analyze {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<Detection>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
///
/// The busy flag enforces the one-session invariant at the handle: a second
/// `collect` while one is running is rejected immediately instead of queueing
/// behind the first.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    busy: Arc<AtomicBool>,
}

/// Clears the busy flag when dropped, so a collect future cancelled at an
/// await point (client disconnect) cannot leave the engine stuck busy.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl EngineHandle {
    /// Run one collection session. Rejects with [`EngineError::Busy`] while
    /// another session is open.
    pub async fn collect(&self, spec: SessionSpec) -> Result<SessionOutcome, EngineError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::Busy);
        }
        let _busy = BusyGuard(&self.busy);

        let (reply_tx, reply_rx) = oneshot::channel();
        match self
            .tx
            .send(EngineRequest::Collect {
                spec,
                reply: reply_tx,
            })
            .await
        {
            Ok(()) => reply_rx.await.unwrap_or(Err(EngineError::ChannelClosed)),
            Err(_) => Err(EngineError::ChannelClosed),
        }
    }

    /// Detect faces in an encoded image (register / image-verify paths).
    pub async fn analyze(&self, image: Vec<u8>) -> Result<Vec<Detection>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Analyze {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread takes sole ownership of the sensor and analyzer handles and
/// serves requests until every handle clone is dropped.
pub fn spawn_engine(
    mut sensor: Box<dyn DepthSensor + Send>,
    mut analyzer: Box<dyn FaceAnalyzer + Send>,
) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("veriface-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Collect { spec, reply } => {
                        let result = run_session(sensor.as_mut(), analyzer.as_mut(), &spec);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Analyze { image, reply } => {
                        let result = run_analyze(analyzer.as_mut(), &image);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle {
        tx,
        busy: Arc::new(AtomicBool::new(false)),
    }
}

/// One collection session: a capture loop feeding a bounded frame queue, the
/// processing loop consuming it in arrival order.
///
/// Ending the session drains the queue before returning so a frame captured
/// for this session can never leak into the next one. The wall-clock cap is
/// enforced on the receive side, so a stalled sensor ends the session too.
fn run_session(
    sensor: &mut (dyn DepthSensor + Send),
    analyzer: &mut (dyn FaceAnalyzer + Send),
    spec: &SessionSpec,
) -> Result<SessionOutcome, EngineError> {
    let mut collector = FrameCollector::new(spec.live_ratio_threshold);
    collector
        .start(spec.mode, spec.max_duration)
        .map_err(|_| EngineError::Busy)?;

    let stop = AtomicBool::new(false);
    let (frame_tx, frame_rx) = std::sync::mpsc::sync_channel(4);
    let deadline = Instant::now() + spec.max_duration;
    let mut sensor_error: Option<SensorError> = None;

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                let frame = sensor.next_frame();
                let failed = frame.is_err();
                if frame_tx.send(frame).is_err() || failed {
                    break;
                }
            }
            drop(frame_tx);
        });

        while !collector.is_done() {
            let timeout = deadline.saturating_duration_since(Instant::now());
            let frame = match frame_rx.recv_timeout(timeout) {
                Ok(frame) => frame,
                Err(_) => break,
            };
            match frame {
                Ok(frame) => match analyzer.detect(&frame.color) {
                    Ok(detections) => {
                        if let Some(det) = detections.into_iter().next() {
                            let verdict = veriface_core::check_liveness(
                                &frame.depth,
                                &det.bbox,
                                &det.landmarks,
                                spec.liveness_threshold_mm,
                            );
                            collector.offer(FrameSample {
                                bbox: det.bbox,
                                is_live: verdict.is_live,
                                liveness: verdict.scores,
                                age: det.age,
                                gender: det.gender,
                                embedding: det.embedding,
                            });
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "frame analysis failed, frame dropped");
                    }
                },
                Err(err) => {
                    sensor_error = Some(err);
                    break;
                }
            }
        }

        stop.store(true, Ordering::Release);
        // Drain whatever the capture loop still has in flight
        while frame_rx.recv().is_ok() {}
    });

    let summary = collector.finalize();
    if summary.no_face_detected() {
        if let Some(err) = sensor_error {
            return Err(EngineError::Sensor(err));
        }
    }

    Ok(SessionOutcome {
        samples: collector.take_samples(),
        summary,
    })
}

fn run_analyze(
    analyzer: &mut (dyn FaceAnalyzer + Send),
    image: &[u8],
) -> Result<Vec<Detection>, EngineError> {
    let decoded = image::load_from_memory(image)
        .map_err(|e| EngineError::InvalidImage(e.to_string()))?
        .to_rgb8();
    Ok(analyzer.detect(&decoded)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::sync::atomic::AtomicUsize;
    use veriface_core::depth::DepthFrame;
    use veriface_core::types::AlignedFrame;
    use veriface_core::{Embedding, FaceBox};

    const SCALE: f32 = 0.001;

    /// 64×64 frame with a smooth 40 mm bump toward the camera at (30, 30),
    /// which passes the nose and curvature liveness tests.
    fn bumped_depth() -> DepthFrame {
        let mut data = Array2::from_elem((64, 64), 1000u16);
        for y in 0..64i64 {
            for x in 0..64i64 {
                let d2 = (x - 30) * (x - 30) + (y - 30) * (y - 30);
                let bump = (40 - d2 / 10).max(0) as u16;
                data[(y as usize, x as usize)] = 1000 - bump;
            }
        }
        DepthFrame::new(data, SCALE)
    }

    fn flat_depth() -> DepthFrame {
        DepthFrame::new(Array2::from_elem((64, 64), 1000u16), SCALE)
    }

    struct StubSensor {
        live: bool,
        delay: Duration,
        frames_served: Arc<AtomicUsize>,
    }

    impl DepthSensor for StubSensor {
        fn next_frame(&mut self) -> Result<AlignedFrame, SensorError> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.frames_served.fetch_add(1, Ordering::Relaxed);
            Ok(AlignedFrame {
                color: image::RgbImage::new(64, 64),
                depth: if self.live { bumped_depth() } else { flat_depth() },
            })
        }
    }

    struct StubAnalyzer;

    impl FaceAnalyzer for StubAnalyzer {
        fn detect(
            &mut self,
            _image: &image::RgbImage,
        ) -> Result<Vec<Detection>, AnalyzerError> {
            Ok(vec![Detection {
                bbox: FaceBox {
                    x1: 10.0,
                    y1: 10.0,
                    x2: 50.0,
                    y2: 50.0,
                },
                landmarks: [
                    (20.0, 20.0),
                    (40.0, 20.0),
                    (30.0, 30.0),
                    (22.0, 42.0),
                    (38.0, 42.0),
                ],
                confidence: 0.99,
                embedding: Some(Embedding {
                    values: vec![1.0, 0.0],
                    model_version: None,
                }),
                age: Some(30),
                gender: Some(1),
            }])
        }
    }

    fn spawn_stub(live: bool, delay: Duration) -> (EngineHandle, Arc<AtomicUsize>) {
        let frames_served = Arc::new(AtomicUsize::new(0));
        let handle = spawn_engine(
            Box::new(StubSensor {
                live,
                delay,
                frames_served: frames_served.clone(),
            }),
            Box::new(StubAnalyzer),
        );
        (handle, frames_served)
    }

    fn count_spec(target: usize) -> SessionSpec {
        SessionSpec {
            mode: CollectMode::Count {
                target_frames: target,
            },
            max_duration: Duration::from_secs(2),
            live_ratio_threshold: 0.9,
            liveness_threshold_mm: 10.0,
        }
    }

    #[tokio::test]
    async fn test_count_session_reaches_target() {
        let (engine, _) = spawn_stub(true, Duration::ZERO);
        let outcome = engine.collect(count_spec(5)).await.unwrap();
        assert_eq!(outcome.summary.total_frames, 5);
        assert_eq!(outcome.summary.live_frames, 5);
        assert!(outcome.summary.is_live_session);
        assert_eq!(outcome.samples.len(), 5);
        assert!(outcome.samples.iter().all(|s| s.embedding.is_some()));
    }

    #[tokio::test]
    async fn test_flat_frames_not_live() {
        let (engine, _) = spawn_stub(false, Duration::ZERO);
        let outcome = engine.collect(count_spec(5)).await.unwrap();
        assert_eq!(outcome.summary.total_frames, 5);
        assert_eq!(outcome.summary.live_frames, 0);
        assert!(!outcome.summary.is_live_session);
    }

    #[tokio::test]
    async fn test_slow_sensor_hits_wall_clock_cap() {
        let (engine, _) = spawn_stub(true, Duration::from_millis(60));
        let spec = SessionSpec {
            max_duration: Duration::from_millis(200),
            ..count_spec(100)
        };
        let outcome = engine.collect(spec).await.unwrap();
        assert!(outcome.summary.total_frames < 100);
        assert!(outcome.summary.elapsed >= Duration::from_millis(200));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_session_rejected() {
        let (engine, _) = spawn_stub(true, Duration::from_millis(20));
        let background = engine.clone();
        let first = tokio::spawn(async move {
            background
                .collect(SessionSpec {
                    max_duration: Duration::from_millis(500),
                    ..count_spec(1000)
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = engine.collect(count_spec(5)).await;
        assert!(matches!(second, Err(EngineError::Busy)));

        // The first session still completes normally
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_collect_releases_busy_flag() {
        let (engine, _) = spawn_stub(true, Duration::from_millis(20));
        let background = engine.clone();
        let first = tokio::spawn(async move {
            background
                .collect(SessionSpec {
                    max_duration: Duration::from_millis(300),
                    ..count_spec(1000)
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Dropping the caller mid-session must not wedge the handle busy
        first.abort();
        let _ = first.await;

        // The next session queues behind the abandoned one and completes
        let outcome = engine.collect(count_spec(3)).await.unwrap();
        assert_eq!(outcome.summary.total_frames, 3);
    }

    #[tokio::test]
    async fn test_sessions_do_not_leak_frames() {
        let (engine, served) = spawn_stub(true, Duration::ZERO);
        let first = engine.collect(count_spec(5)).await.unwrap();
        let after_first = served.load(Ordering::Relaxed);
        // Capture may have overrun the target; the drain threw those away
        assert!(after_first >= first.summary.total_frames);

        let second = engine.collect(count_spec(5)).await.unwrap();
        assert_eq!(second.summary.total_frames, 5);
        assert!(served.load(Ordering::Relaxed) > after_first);
    }

    #[tokio::test]
    async fn test_analyze_rejects_undecodable_image() {
        let (engine, _) = spawn_stub(true, Duration::ZERO);
        let result = engine.analyze(vec![0xde, 0xad, 0xbe, 0xef]).await;
        assert!(matches!(result, Err(EngineError::InvalidImage(_))));
    }

    #[tokio::test]
    async fn test_analyze_decodes_and_detects() {
        let (engine, _) = spawn_stub(true, Duration::ZERO);
        let mut png = Vec::new();
        image::RgbImage::new(64, 64)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let detections = engine.analyze(png).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].age, Some(30));
    }
}
