use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use video_searcher::{AnalysisError, BackendError, QueueConfig, QueueError, RequestSerializer, ShutdownMode};

fn serializer(max: usize, delay_ms: u64) -> RequestSerializer {
    RequestSerializer::new(QueueConfig::new(max, Duration::from_millis(delay_ms)))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_slot_starts_jobs_in_submission_order() {
    let q = serializer(1, 2);
    let started = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let started = Arc::clone(&started);
            q.enqueue(move || async move {
                started.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(3)).await;
                Ok::<_, AnalysisError>(i)
            })
        })
        .collect();
    for (i, h) in handles.into_iter().enumerate() {
        assert_eq!(h.await.unwrap(), i);
    }
    assert_eq!(*started.lock().unwrap(), (0..8).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submitters_are_started_in_enqueue_order() {
    let q = serializer(1, 1);
    let next_seq = Arc::new(Mutex::new(0usize));
    let started = Arc::new(Mutex::new(Vec::new()));

    let submitters: Vec<_> = (0..12)
        .map(|_| {
            let q = q.clone();
            let next_seq = Arc::clone(&next_seq);
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                // Numbering and enqueueing under one lock pins the enqueue order.
                let handle = {
                    let mut seq = next_seq.lock().unwrap();
                    let n = *seq;
                    *seq += 1;
                    q.enqueue(move || async move {
                        started.lock().unwrap().push(n);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        Ok::<_, AnalysisError>(n)
                    })
                };
                handle.await
            })
        })
        .collect();

    for s in submitters {
        s.await.unwrap().unwrap();
    }
    assert_eq!(*started.lock().unwrap(), (0..12).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn active_jobs_never_exceed_limit() {
    let q = serializer(2, 1);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..10)
        .map(|_| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let observer = q.clone();
            q.enqueue(move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(observer.stats().active_count <= 2);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, AnalysisError>(())
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(q.stats().total_pending, 0);
}

#[tokio::test]
async fn failure_reaches_only_its_caller() {
    let q = serializer(1, 1);
    let bad = q.enqueue(|| async {
        Err::<u32, _>(AnalysisError::from(BackendError::new("upstream_error", "503", true)))
    });
    let good = q.enqueue(|| async { Ok::<_, AnalysisError>(42) });
    assert_eq!(bad.await.unwrap_err().code(), "upstream_error");
    assert_eq!(good.await.unwrap(), 42);
}

#[tokio::test]
async fn quiescence_delay_separates_jobs() {
    let q = serializer(1, 40);
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let mk = |stamps: Arc<Mutex<Vec<Instant>>>| {
        move || async move {
            stamps.lock().unwrap().push(Instant::now());
            Ok::<_, AnalysisError>(())
        }
    };
    let a = q.enqueue(mk(Arc::clone(&stamps)));
    let b = q.enqueue(mk(Arc::clone(&stamps)));
    a.await.unwrap();
    b.await.unwrap();
    let s = stamps.lock().unwrap();
    assert!(s[1].duration_since(s[0]) >= Duration::from_millis(40));
}

#[tokio::test]
async fn reject_shutdown_fails_waiting_jobs() {
    let q = serializer(1, 1);
    let (open, gate) = tokio::sync::oneshot::channel::<()>();
    let first = q.enqueue(move || async move {
        let _ = gate.await;
        Ok::<_, AnalysisError>("first")
    });
    let second = q.enqueue(|| async { Ok::<_, AnalysisError>("second") });
    while q.stats().active_count == 0 {
        tokio::task::yield_now().await;
    }

    let q2 = q.clone();
    let shutdown = tokio::spawn(async move { q2.shutdown(ShutdownMode::Reject).await });
    let err = second.await.unwrap_err();
    assert!(matches!(err, AnalysisError::Queue(QueueError::Closed)));

    // the running job still completes
    open.send(()).unwrap();
    assert_eq!(first.await.unwrap(), "first");
    shutdown.await.unwrap();

    let late = q.enqueue(|| async { Ok::<_, AnalysisError>("late") });
    assert_eq!(late.await.unwrap_err().code(), "queue_closed");
}

#[tokio::test]
async fn drain_shutdown_runs_everything_queued() {
    let q = serializer(1, 1);
    let done = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let done = Arc::clone(&done);
            q.enqueue(move || async move {
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, AnalysisError>(())
            })
        })
        .collect();
    q.shutdown(ShutdownMode::Drain).await;
    assert_eq!(done.load(Ordering::SeqCst), 4);
    for h in handles {
        h.await.unwrap();
    }
    assert!(q.is_closed());
}
