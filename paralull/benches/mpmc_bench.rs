use criterion::{criterion_group, criterion_main, Bencher, Criterion};
use paralull::{MpmcQueue, WfQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const ITEMS_PER_THREAD_TARGET: usize = 200_000;
const THREAD_COUNTS_TO_TEST: &[(usize, usize)] = &[
   (1, 1),
   (2, 2),
   (4, 4),
   (7, 7),
];

/// Runs one producer/consumer round on a fresh queue and returns the time
/// from the start barrier until the last consumer is done.
fn run_mpmc<Q>(queue: Arc<Q>, num_prods: usize, num_cons: usize, items_per_thread: usize) -> Duration
where
   Q: MpmcQueue<usize> + 'static,
{
   let total_items = num_prods * items_per_thread;
   let consumed = Arc::new(AtomicUsize::new(0));
   let start = Arc::new(Barrier::new(num_prods + num_cons + 1));

   let mut handles = Vec::with_capacity(num_prods + num_cons);

   for p in 0..num_prods {
      let q = Arc::clone(&queue);
      let start = Arc::clone(&start);
      handles.push(thread::spawn(move || {
         start.wait();
         for i in 0..items_per_thread {
            q.push(p * items_per_thread + i);
         }
      }));
   }

   for _ in 0..num_cons {
      let q = Arc::clone(&queue);
      let start = Arc::clone(&start);
      let consumed = Arc::clone(&consumed);
      handles.push(thread::spawn(move || {
         start.wait();
         while consumed.load(Ordering::Relaxed) < total_items {
            match q.pop() {
               Some(_) => {
                  consumed.fetch_add(1, Ordering::Relaxed);
               }
               None => std::hint::spin_loop(),
            }
         }
      }));
   }

   start.wait();
   let start_time = Instant::now();
   for h in handles {
      h.join().unwrap();
   }
   let duration = start_time.elapsed();

   assert_eq!(consumed.load(Ordering::Relaxed), total_items);
   duration
}

fn bench_wf_queue(c: &mut Criterion) {
   let mut group = c.benchmark_group("WfQueueMPMC");

   for &(num_prods, num_cons) in THREAD_COUNTS_TO_TEST {
      let items_per_thread = ITEMS_PER_THREAD_TARGET;

      group.bench_function(
         format!("{}P_{}C", num_prods, num_cons),
         |b: &mut Bencher| {
            b.iter_custom(|iters| {
               let mut total = Duration::ZERO;
               for _ in 0..iters {
                  let q = Arc::new(WfQueue::<usize>::new());
                  total += run_mpmc(q, num_prods, num_cons, items_per_thread);
               }
               total
            })
         },
      );
   }

   group.finish();
}

fn custom_criterion() -> Criterion {
   Criterion::default()
      .warm_up_time(Duration::from_secs(2))
      .measurement_time(Duration::from_secs(10))
      .sample_size(10)
}

criterion_group! {
   name = benches;
   config = custom_criterion();
   targets = bench_wf_queue
}
criterion_main!(benches);
