//! Stop synchronisation across workers and queues

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use relaycast::error::{PipelineError, Result};
use relaycast::pipeline::stage::{PipelineStage, StageWorker};
use relaycast::pipeline::{BoundedQueue, StageState};
use relaycast::telemetry::NullTelemetry;

/// Records every item and marks when `on_stop` ran
struct Recorder {
    seen: Arc<Mutex<Vec<u32>>>,
    stop_calls: Arc<AtomicUsize>,
    drain: bool,
    delay: Duration,
}

impl PipelineStage for Recorder {
    type Input = u32;

    fn name(&self) -> &'static str {
        "recorder"
    }

    fn drain_on_stop(&self) -> bool {
        self.drain
    }

    fn process(&mut self, item: u32) -> Result<()> {
        thread::sleep(self.delay);
        self.seen.lock().unwrap().push(item);
        if item == u32::MAX {
            return Err(PipelineError::fatal("recorder", "poison item"));
        }
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn recorder(drain: bool, delay: Duration) -> (Recorder, Arc<Mutex<Vec<u32>>>, Arc<AtomicUsize>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let stop_calls = Arc::new(AtomicUsize::new(0));
    let stage = Recorder {
        seen: seen.clone(),
        stop_calls: stop_calls.clone(),
        drain,
        delay,
    };
    (stage, seen, stop_calls)
}

#[test]
fn stop_returns_after_queue_is_drained() {
    let queue = Arc::new(BoundedQueue::new(1000, Duration::from_millis(100)));
    let (stage, seen, stop_calls) = recorder(true, Duration::from_micros(200));
    let mut worker = StageWorker::new(stage, queue.clone(), Arc::new(NullTelemetry));

    worker.start().unwrap();
    for i in 0..300 {
        assert!(queue.enqueue(i));
    }
    worker.stop();

    assert_eq!(*seen.lock().unwrap(), (0..300).collect::<Vec<_>>());
    assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(worker.state(), StageState::Idle);
    assert!(!worker.is_busy());

    // nothing runs after stop returned
    queue.enqueue(999);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(seen.lock().unwrap().len(), 300);
}

#[test]
fn non_draining_stage_leaves_queue_alone() {
    let queue = Arc::new(BoundedQueue::new(1000, Duration::from_millis(100)));
    let (stage, seen, stop_calls) = recorder(false, Duration::from_millis(5));
    let mut worker = StageWorker::new(stage, queue.clone(), Arc::new(NullTelemetry));

    for i in 0..100 {
        queue.enqueue(i);
    }
    worker.start().unwrap();
    thread::sleep(Duration::from_millis(12));
    worker.stop();

    let processed = seen.lock().unwrap().len();
    assert!(processed < 100);
    assert_eq!(processed + queue.len(), 100);
    assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn clear_releases_blocked_producer() {
    let queue = Arc::new(BoundedQueue::new(2, Duration::from_millis(100)));
    queue.enqueue(1);
    queue.enqueue(2);

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || queue.enqueue(3))
    };
    thread::sleep(Duration::from_millis(20));
    assert_eq!(queue.clear(), 2);
    assert!(!producer.join().unwrap());
    assert!(queue.is_empty());
}

#[test]
fn fatal_error_stops_only_the_failing_worker() {
    let upstream_queue = Arc::new(BoundedQueue::new(16, Duration::from_millis(50)));
    let downstream_queue = Arc::new(BoundedQueue::new(16, Duration::from_millis(50)));

    let (failing, failing_seen, failing_stops) = recorder(true, Duration::ZERO);
    let (healthy, healthy_seen, _) = recorder(true, Duration::ZERO);
    let mut failing = StageWorker::new(failing, upstream_queue.clone(), Arc::new(NullTelemetry));
    let mut healthy = StageWorker::new(healthy, downstream_queue.clone(), Arc::new(NullTelemetry));

    failing.start().unwrap();
    healthy.start().unwrap();
    upstream_queue.enqueue(u32::MAX);
    upstream_queue.enqueue(7);

    for _ in 0..100 {
        if !failing.is_running() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(!failing.is_running());
    assert!(healthy.is_running());

    downstream_queue.enqueue(1);
    healthy.stop();
    failing.stop();

    assert_eq!(*failing_seen.lock().unwrap(), vec![u32::MAX]);
    assert_eq!(failing_stops.load(Ordering::SeqCst), 1);
    assert!(failing.take_error().is_some_and(|e| e.is_fatal()));
    assert_eq!(*healthy_seen.lock().unwrap(), vec![1]);
}

#[test]
fn stop_before_start_runs_on_stop_once() {
    let queue = Arc::new(BoundedQueue::new(4, Duration::from_millis(10)));
    let (stage, _, stop_calls) = recorder(true, Duration::ZERO);
    let mut worker = StageWorker::new(stage, queue, Arc::new(NullTelemetry));
    worker.stop();
    worker.stop();
    assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
    assert!(worker.stage().is_some());
}
