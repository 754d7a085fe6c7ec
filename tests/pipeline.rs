//! End-to-end behaviour of the frame pipeline with fake transforms

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use framegate::capture::SyntheticCamera;
use framegate::pipeline::CycleState;
use framegate::{
    CaptureConfig, Delivery, NativeFrame, Pipeline, PipelineConfig, PlaneLayout, RawFrame,
    TransformError,
};

const OUT_W: u32 = 4;
const OUT_H: u32 = 2;

fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        output_width: OUT_W,
        output_height: OUT_H,
        transform_timeout_ms: 5_000,
        ..PipelineConfig::default()
    }
}

fn camera() -> SyntheticCamera {
    SyntheticCamera::new(CaptureConfig {
        width: OUT_W,
        height: OUT_H,
        fps: 30,
        row_padding: 3,
    })
}

fn output(fill: u8) -> Vec<u8> {
    vec![fill; (OUT_W * OUT_H * 4) as usize]
}

fn spawn<F>(transform: F) -> Pipeline
where
    F: Fn(RawFrame) -> Result<Option<Vec<u8>>, TransformError> + Send + Sync + 'static,
{
    spawn_with(pipeline_config(), transform)
}

fn spawn_with<F>(config: PipelineConfig, transform: F) -> Pipeline
where
    F: Fn(RawFrame) -> Result<Option<Vec<u8>>, TransformError> + Send + Sync + 'static,
{
    Pipeline::spawn(config, Arc::new(transform)).unwrap()
}

async fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Wait until `n` cycles have ended and the gate is open again.
async fn wait_cycles(pipeline: &Pipeline, n: u64) {
    let gate = pipeline.gate().clone();
    wait_for("cycles to finish", move || {
        let stats = gate.stats();
        stats.completed + stats.failed >= n && gate.is_idle()
    })
    .await;
}

/// Transform that blocks until the test lets it go.
fn held_transform() -> (
    impl Fn(RawFrame) -> Result<Option<Vec<u8>>, TransformError> + Send + Sync + 'static,
    mpsc::Sender<()>,
) {
    let (tx, rx) = mpsc::channel::<()>();
    let rx = Mutex::new(rx);
    let transform = move |_: RawFrame| -> Result<Option<Vec<u8>>, TransformError> {
        let _ = rx.lock().unwrap().recv();
        Ok(Some(output(50)))
    };
    (transform, tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_during_a_cycle_are_dropped_and_gate_reopens() {
    let (transform, release) = held_transform();
    let pipeline = spawn(transform);
    let adapter = pipeline.adapter();
    let mut camera = camera();

    // t=0 accepted, dispatched and held
    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Accepted);
    let gate = pipeline.gate().clone();
    wait_for("dispatch", || gate.state() == CycleState::Dispatched).await;

    // t=1ms, t=2ms arrive while in flight
    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Dropped);
    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Dropped);

    // t=5ms the cycle completes
    release.send(()).unwrap();
    wait_cycles(&pipeline, 1).await;
    assert_eq!(pipeline.sink().current_image().unwrap().sequence(), 0);

    // t=6ms the next frame is accepted
    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Accepted);
    release.send(()).unwrap();
    wait_cycles(&pipeline, 2).await;
    assert_eq!(pipeline.sink().current_image().unwrap().sequence(), 3);

    let stats = pipeline.gate().stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.dropped, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(camera.released(), 4);

    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_output_length_fails_cycle_without_touching_display() {
    let first = AtomicBool::new(true);
    let pipeline = spawn(move |_: RawFrame| {
        if first.swap(false, Ordering::SeqCst) {
            Ok(Some(output(9)))
        } else {
            Ok(Some(vec![0u8; 5]))
        }
    });
    let adapter = pipeline.adapter();
    let mut camera = camera();

    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Accepted);
    wait_cycles(&pipeline, 1).await;
    let shown = pipeline.sink().current_image().unwrap();
    let window = pipeline.sink().latency_window().len();

    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Accepted);
    wait_cycles(&pipeline, 2).await;

    let stats = pipeline.gate().stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 1);

    // Image untouched, latency still advances
    let still_shown = pipeline.sink().current_image().unwrap();
    assert!(Arc::ptr_eq(&shown, &still_shown));
    assert_eq!(pipeline.sink().latency_window().len(), window + 1);
    assert_eq!(
        pipeline.sink().current_latency_ms(),
        pipeline.sink().latency_window()[window].as_millis() as u64
    );

    // Still alive
    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Accepted);
    wait_cycles(&pipeline, 3).await;
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn always_failing_transform_never_publishes() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let pipeline = spawn(move |_: RawFrame| {
        let n = seen.fetch_add(1, Ordering::SeqCst);
        match n % 3 {
            0 => Err(TransformError::Failed("no keypoints".into())),
            1 => Ok(None),
            _ => panic!("transform crashed"),
        }
    });
    let adapter = pipeline.adapter();
    let mut camera = camera();

    for i in 0..30 {
        assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Accepted);
        wait_cycles(&pipeline, i + 1).await;
    }

    assert_eq!(calls.load(Ordering::SeqCst), 30);
    assert!(pipeline.sink().current_image().is_none());
    assert_eq!(pipeline.sink().latency_window().len(), 30);
    assert_eq!(pipeline.gate().stats().failed, 30);
    assert_eq!(camera.outstanding(), 0);
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_cycles_are_timed() {
    let pipeline = spawn(|_: RawFrame| {
        std::thread::sleep(Duration::from_millis(5));
        Err(TransformError::Failed("nope".into()))
    });
    let adapter = pipeline.adapter();
    let mut camera = camera();

    adapter.deliver(camera.next_frame());
    wait_cycles(&pipeline, 1).await;

    assert!(pipeline.sink().current_image().is_none());
    assert!(pipeline.sink().current_latency_ms() >= 5);
    assert_eq!(pipeline.sink().latency_window().len(), 1);
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn untimed_failures_leave_latency_alone() {
    let config = PipelineConfig {
        record_failed_latency: false,
        ..pipeline_config()
    };
    let pipeline = spawn_with(config, |_: RawFrame| {
        std::thread::sleep(Duration::from_millis(5));
        Err(TransformError::Failed("nope".into()))
    });
    let adapter = pipeline.adapter();
    let mut camera = camera();

    adapter.deliver(camera.next_frame());
    wait_cycles(&pipeline, 1).await;

    assert_eq!(pipeline.gate().stats().failed, 1);
    assert_eq!(pipeline.sink().current_latency_ms(), 0);
    assert!(pipeline.sink().latency_window().is_empty());
    pipeline.shutdown().await;
}

/// Transform that reports how many calls are inside it at once.
fn counting_transform(
    slow_calls: usize,
    delay: Duration,
) -> (
    impl Fn(RawFrame) -> Result<Option<Vec<u8>>, TransformError> + Send + Sync + 'static,
    Arc<AtomicUsize>,
    Arc<AtomicUsize>,
) {
    let calls = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let in_flight = AtomicUsize::new(0);
    let (seen, max) = (calls.clone(), max_seen.clone());
    let transform = move |_: RawFrame| -> Result<Option<Vec<u8>>, TransformError> {
        let n = seen.fetch_add(1, Ordering::SeqCst);
        max.fetch_max(in_flight.fetch_add(1, Ordering::SeqCst) + 1, Ordering::SeqCst);
        if n < slow_calls {
            std::thread::sleep(delay);
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(Some(output(1)))
    };
    (transform, calls, max_seen)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hung_transform_times_out_and_gate_reopens() {
    let config = PipelineConfig {
        transform_timeout_ms: 50,
        ..pipeline_config()
    };
    let (transform, calls, max_seen) = counting_transform(1, Duration::from_millis(300));
    let pipeline = spawn_with(config, transform);
    let adapter = pipeline.adapter();
    let mut camera = camera();

    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Accepted);
    wait_cycles(&pipeline, 1).await;
    assert_eq!(pipeline.gate().stats().failed, 1);

    // The gate is open again, but the timed-out call still owns the
    // transform until it returns
    let started = Instant::now();
    while pipeline.sink().current_image().is_none() {
        assert!(started.elapsed() < Duration::from_secs(10), "no frame got through");
        adapter.deliver(camera.next_frame());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    wait_cycles(&pipeline, pipeline.gate().stats().accepted).await;

    let stats = pipeline.gate().stats();
    assert!(stats.accepted >= 2);
    assert!(stats.completed >= 1);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(calls.load(Ordering::SeqCst) as u64 <= stats.accepted);
    assert_eq!(camera.outstanding(), 0);
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn timed_out_calls_never_overlap() {
    let config = PipelineConfig {
        transform_timeout_ms: 20,
        ..pipeline_config()
    };
    let (transform, calls, max_seen) = counting_transform(usize::MAX, Duration::from_secs(1));
    let pipeline = spawn_with(config, transform);
    let adapter = pipeline.adapter();
    let mut camera = camera();

    let started = Instant::now();
    while started.elapsed() < Duration::from_millis(250) {
        adapter.deliver(camera.next_frame());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    wait_cycles(&pipeline, pipeline.gate().stats().accepted).await;

    // Every cycle failed and the gate kept reopening, yet only the first
    // frame ever reached the transform
    let stats = pipeline.gate().stats();
    assert!(stats.accepted > 1);
    assert_eq!(stats.failed, stats.accepted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_more_than_one_cycle_in_flight() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let (cur, max) = (in_flight.clone(), max_seen.clone());
    let pipeline = spawn(move |frame: RawFrame| {
        let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(Duration::from_micros(300));
        cur.fetch_sub(1, Ordering::SeqCst);
        if frame.sequence() % 5 == 0 {
            Err(TransformError::Failed("every fifth".into()))
        } else {
            Ok(Some(output(3)))
        }
    });

    let producers = 4;
    let per_producer = 200;
    let releases = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..producers)
        .map(|_| {
            let adapter = pipeline.adapter();
            let releases = releases.clone();
            std::thread::spawn(move || {
                let mut outcomes = Vec::new();
                for i in 0..per_producer {
                    // Every seventh frame is malformed
                    let layout = if i % 7 == 0 {
                        PlaneLayout {
                            row_stride: 1,
                            ..PlaneLayout::packed(OUT_W, OUT_H)
                        }
                    } else {
                        PlaneLayout::packed(OUT_W, OUT_H)
                    };
                    outcomes.push(adapter.deliver(CountedFrame {
                        plane: output(7),
                        layout,
                        releases: releases.clone(),
                    }));
                    std::thread::sleep(Duration::from_micros(50));
                }
                outcomes
            })
        })
        .collect();

    let outcomes: Vec<Delivery> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    let accepted = outcomes.iter().filter(|d| **d == Delivery::Accepted).count() as u64;
    wait_cycles(&pipeline, accepted).await;

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(releases.load(Ordering::SeqCst), producers * per_producer);

    let stats = pipeline.gate().stats();
    assert_eq!(stats.accepted, accepted);
    assert_eq!(stats.completed + stats.failed, accepted);
    let rejected = outcomes.iter().filter(|d| **d == Delivery::Rejected).count() as u64;
    assert_eq!(stats.offered + rejected, (producers * per_producer) as u64);
    pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn latency_window_stays_at_one_hundred() {
    let pipeline = spawn(|_: RawFrame| Ok(Some(output(2))));
    let adapter = pipeline.adapter();
    let mut camera = camera();

    for i in 0..120 {
        assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Accepted);
        wait_cycles(&pipeline, i + 1).await;
    }

    assert_eq!(pipeline.sink().latency_window().len(), 100);
    let metrics = pipeline.metrics();
    assert_eq!(metrics.cycles_completed, 120);
    assert_eq!(metrics.dropped_frames, 0);
    assert_eq!(pipeline.sink().latency_stats().count, 100);

    let image = pipeline.sink().current_image().unwrap();
    assert_eq!((image.width(), image.height()), (OUT_H, OUT_W));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let pipeline = spawn(|_: RawFrame| Ok(Some(output(2))));
    let adapter = pipeline.adapter();
    pipeline.shutdown().await;

    let mut camera = camera();
    assert_eq!(adapter.deliver(camera.next_frame()), Delivery::Dropped);
    assert_eq!(camera.outstanding(), 0);
}

struct CountedFrame {
    plane: Vec<u8>,
    layout: PlaneLayout,
    releases: Arc<AtomicUsize>,
}

impl NativeFrame for CountedFrame {
    fn layout(&self) -> PlaneLayout {
        self.layout
    }

    fn plane(&self) -> &[u8] {
        &self.plane
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}
