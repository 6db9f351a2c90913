use paralull::WfQueue;
use std::sync::atomic::{AtomicI8, AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const SEGMENT_CELLS: usize = 1024;

fn tag(producer: usize, seq: usize) -> usize {
    (producer << 32) | seq
}

fn untag(value: usize) -> (usize, usize) {
    (value >> 32, value & 0xFFFF_FFFF)
}

/// Producers and consumers in equal numbers, each moving `per_thread` values.
/// Every tagged value is counted up when enqueued and down when dequeued, so
/// a duplicate and a loss can never cancel out. Each consumer must also see
/// every producer's values in the order they were enqueued.
fn run_balanced(threads: usize, per_thread: usize) {
    let queue = Arc::new(WfQueue::new());
    let net: Arc<Vec<AtomicI8>> =
        Arc::new((0..threads * per_thread).map(|_| AtomicI8::new(0)).collect());
    let dequeued = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(Barrier::new(threads * 2));

    let producers: Vec<_> = (0..threads)
        .map(|p| {
            let q = Arc::clone(&queue);
            let net = Arc::clone(&net);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for seq in 0..per_thread {
                    net[p * per_thread + seq].fetch_add(1, Ordering::Relaxed);
                    q.enqueue(tag(p, seq));
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..threads)
        .map(|_| {
            let q = Arc::clone(&queue);
            let net = Arc::clone(&net);
            let dequeued = Arc::clone(&dequeued);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut last_seen: Vec<Option<usize>> = vec![None; threads];
                let mut taken = 0;
                while taken < per_thread {
                    match q.dequeue() {
                        Some(v) => {
                            let (p, seq) = untag(v);
                            assert!(
                                p < threads && seq < per_thread,
                                "Phantom value {:#x}",
                                v
                            );
                            if let Some(prev) = last_seen[p] {
                                assert!(
                                    seq > prev,
                                    "Producer {} order violated: {} after {}",
                                    p,
                                    seq,
                                    prev
                                );
                            }
                            last_seen[p] = Some(seq);
                            net[p * per_thread + seq].fetch_sub(1, Ordering::Relaxed);
                            dequeued.fetch_add(1, Ordering::Relaxed);
                            taken += 1;
                        }
                        None => thread::yield_now(),
                    }
                }
            })
        })
        .collect();

    for handle in producers.into_iter().chain(consumers) {
        handle.join().unwrap();
    }

    assert_eq!(dequeued.load(Ordering::Relaxed), threads * per_thread);
    for (slot, count) in net.iter().enumerate() {
        assert_eq!(
            count.load(Ordering::Relaxed),
            0,
            "Tag {:#x} did not net to zero",
            tag(slot / per_thread, slot % per_thread)
        );
    }
    assert_eq!(queue.dequeue(), None, "Queue should be drained");
    assert!(queue.is_empty(), "Queue should be empty after draining");
}

#[test]
#[cfg_attr(miri, ignore)]
fn stress_fifty_producers_fifty_consumers() {
    run_balanced(50, 100_000);
}

#[test]
#[cfg_attr(miri, ignore)]
fn stress_small_thread_count() {
    run_balanced(4, 50_000);
}

#[test]
#[cfg_attr(miri, ignore)]
fn producer_order_survives_contention() {
    // One producer, many consumers: the merged output must be exactly the
    // producer's sequence once the consumers' views are interleaved by value.
    let items = 200_000;
    let consumers = 8;
    let queue = Arc::new(WfQueue::new());
    let remaining = Arc::new(AtomicIsize::new(items as isize));

    let readers: Vec<_> = (0..consumers)
        .map(|_| {
            let q = Arc::clone(&queue);
            let remaining = Arc::clone(&remaining);
            thread::spawn(move || {
                let mut got = Vec::new();
                while remaining.load(Ordering::Acquire) > 0 {
                    match q.dequeue() {
                        Some(v) => {
                            if let Some(&prev) = got.last() {
                                assert!(v > prev, "Out of order: {} after {}", v, prev);
                            }
                            got.push(v);
                            remaining.fetch_sub(1, Ordering::AcqRel);
                        }
                        None => thread::yield_now(),
                    }
                }
                got
            })
        })
        .collect();

    for i in 0..items {
        queue.enqueue(i);
    }

    let mut all: Vec<usize> = readers.into_iter().flat_map(|r| r.join().unwrap()).collect();
    all.sort_unstable();
    assert_eq!(all, (0..items).collect::<Vec<_>>());
}

#[test]
fn single_thread_reclaims_leading_segments() {
    let queue = WfQueue::new();
    let rounds = 64 * SEGMENT_CELLS;
    let mut peak = 0;
    for i in 0..rounds {
        queue.enqueue(i);
        assert_eq!(queue.dequeue(), Some(i));
        peak = peak.max(queue.retained_segments());
    }
    assert!(
        peak <= 2 * 16 + 2,
        "Segments kept growing: peak {} after {} operations",
        peak,
        rounds
    );
    assert!(queue.retained_segments() < 64);
}

#[test]
fn backlog_is_reclaimed_once_consumed() {
    let queue = WfQueue::new();
    let backlog = 20 * SEGMENT_CELLS;
    for i in 0..backlog {
        queue.enqueue(i);
    }
    assert!(queue.retained_segments() >= 20);

    for i in 0..backlog {
        assert_eq!(queue.dequeue(), Some(i));
    }
    // Keep the head moving so the last dequeues get a chance to clean up.
    for i in 0..2 * 16 * SEGMENT_CELLS {
        queue.enqueue(i);
        queue.dequeue();
    }
    assert!(
        queue.retained_segments() <= 2 * 16 + 2,
        "Backlog segments were not reclaimed: {}",
        queue.retained_segments()
    );
}

#[test]
fn idle_handles_do_not_pin_segments() {
    let queue = WfQueue::new();
    let idle: Vec<_> = (0..4).map(|_| queue.register()).collect();

    for i in 0..48 * SEGMENT_CELLS {
        queue.enqueue(i);
        assert_eq!(queue.dequeue(), Some(i));
    }
    assert!(
        queue.retained_segments() <= 2 * 16 + 2,
        "Idle handles held back reclamation: {}",
        queue.retained_segments()
    );

    // The idle handles' cursors were moved past the freed segments.
    for h in &idle {
        h.enqueue(usize::MAX);
        assert_eq!(h.dequeue(), Some(usize::MAX));
    }
}

#[test]
#[cfg_attr(miri, ignore)]
fn concurrent_reclamation_keeps_values() {
    let threads = 8;
    let per_thread = 40 * SEGMENT_CELLS;
    let queue = Arc::new(WfQueue::new());
    let sum = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let q = Arc::clone(&queue);
            let sum = Arc::clone(&sum);
            thread::spawn(move || {
                for i in 0..per_thread {
                    q.enqueue(t * per_thread + i + 1);
                    loop {
                        if let Some(v) = q.dequeue() {
                            sum.fetch_add(v, Ordering::Relaxed);
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    let n = threads * per_thread;
    assert_eq!(sum.load(Ordering::Relaxed), n * (n + 1) / 2);
    assert_eq!(queue.dequeue(), None);
    assert!(queue.retained_segments() < n / SEGMENT_CELLS);
}
