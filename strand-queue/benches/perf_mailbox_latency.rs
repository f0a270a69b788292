//! Ping-pong latency of the single-consumer mailboxes, with crossbeam's
//! ArrayQueue as the baseline.
//!
//! Run: cargo bench --bench perf_mailbox_latency
//! Profile: sudo taskset -c 0,2 ./target/release/deps/perf_mailbox_latency-*

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use hdrhistogram::Histogram;
use strand_queue::single_consumer::{array, linked};

const WARMUP: usize = 10_000;
const SAMPLES: usize = 1_000_000;
const CAPACITY: usize = 64;

#[cfg(target_arch = "x86_64")]
#[inline]
fn rdtscp() -> u64 {
    unsafe {
        let mut aux: u32 = 0;
        core::arch::x86_64::__rdtscp(&mut aux)
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline]
fn rdtscp() -> u64 {
    use std::sync::OnceLock;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// One side of a ping-pong: push a token, then spin until one comes back.
trait Endpoint: Send + 'static {
    fn send(&mut self, v: u64);
    fn recv(&mut self) -> Option<u64>;
}

struct ArrayEnd {
    tx: array::Sender<u64>,
    rx: array::Receiver<u64>,
}

impl Endpoint for ArrayEnd {
    fn send(&mut self, v: u64) {
        while self.tx.enq(v).is_err() {
            std::hint::spin_loop();
        }
    }

    fn recv(&mut self) -> Option<u64> {
        self.rx.poll()
    }
}

struct LinkedEnd {
    tx: linked::Sender<u64>,
    rx: linked::Receiver<u64>,
}

impl Endpoint for LinkedEnd {
    fn send(&mut self, v: u64) {
        self.tx.enq(v);
    }

    fn recv(&mut self) -> Option<u64> {
        self.rx.poll()
    }
}

struct CrossbeamEnd {
    tx: Arc<ArrayQueue<u64>>,
    rx: Arc<ArrayQueue<u64>>,
}

impl Endpoint for CrossbeamEnd {
    fn send(&mut self, v: u64) {
        while self.tx.push(v).is_err() {
            std::hint::spin_loop();
        }
    }

    fn recv(&mut self) -> Option<u64> {
        self.rx.pop()
    }
}

fn round_trip(end: &mut impl Endpoint, v: u64) {
    end.send(v);
    while end.recv().is_none() {
        std::hint::spin_loop();
    }
}

fn ping_pong<E: Endpoint>(mut main: E, mut echo: E) -> Histogram<u64> {
    let total = WARMUP + SAMPLES;

    let worker = thread::spawn(move || {
        for _ in 0..total {
            let v = loop {
                if let Some(v) = echo.recv() {
                    break v;
                }
                std::hint::spin_loop();
            };
            echo.send(v);
        }
    });

    for i in 0..WARMUP {
        round_trip(&mut main, i as u64);
    }

    let mut hist = Histogram::<u64>::new_with_max(1_000_000, 3).unwrap();
    for i in 0..SAMPLES {
        let start = rdtscp();
        round_trip(&mut main, i as u64);
        let end = rdtscp();
        let _ = hist.record((end.wrapping_sub(start) / 2).min(1_000_000));
    }

    worker.join().unwrap();
    hist
}

fn estimate_cpu_freq_ghz() -> f64 {
    let start_cycles = rdtscp();
    let start = Instant::now();
    thread::sleep(Duration::from_millis(100));
    let cycles = rdtscp().wrapping_sub(start_cycles);
    cycles as f64 / start.elapsed().as_nanos() as f64
}

fn print_histogram(name: &str, hist: &Histogram<u64>, cpu_ghz: f64) {
    println!("{name} one-way latency:");
    for (label, q) in [("p50", 0.50), ("p90", 0.90), ("p99", 0.99), ("p999", 0.999)] {
        let cycles = hist.value_at_quantile(q);
        println!(
            "  {label:<5} {cycles:>7} cycles  {:>7.1} ns",
            cycles as f64 / cpu_ghz
        );
    }
    println!("  max   {:>7} cycles", hist.max());
    println!();
}

fn main() {
    println!("Warmup:   {WARMUP:>8}");
    println!("Samples:  {SAMPLES:>8}");
    println!("Capacity: {CAPACITY:>8}");
    println!();

    let cpu_ghz = estimate_cpu_freq_ghz();

    let (a_tx, a_rx) = array::channel(CAPACITY);
    let (b_tx, b_rx) = array::channel(CAPACITY);
    let hist = ping_pong(
        ArrayEnd { tx: a_tx, rx: b_rx },
        ArrayEnd { tx: b_tx, rx: a_rx },
    );
    print_histogram("single_consumer::array", &hist, cpu_ghz);

    let (a_tx, a_rx) = linked::channel();
    let (b_tx, b_rx) = linked::channel();
    let hist = ping_pong(
        LinkedEnd { tx: a_tx, rx: b_rx },
        LinkedEnd { tx: b_tx, rx: a_rx },
    );
    print_histogram("single_consumer::linked", &hist, cpu_ghz);

    let a = Arc::new(ArrayQueue::new(CAPACITY));
    let b = Arc::new(ArrayQueue::new(CAPACITY));
    let hist = ping_pong(
        CrossbeamEnd {
            tx: Arc::clone(&a),
            rx: Arc::clone(&b),
        },
        CrossbeamEnd { tx: b, rx: a },
    );
    print_histogram("crossbeam ArrayQueue", &hist, cpu_ghz);

    println!("Estimated CPU freq: {cpu_ghz:.2} GHz");
}
