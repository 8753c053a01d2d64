// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use multitask::chan::Chan;
use multitask::sync::{ARendez, rendez};
use multitask::task;
use std::sync::Arc;

const PINGS: usize = 10_000;

fn ping_ping_10k(c: &mut Criterion) {
    c.bench_function("ping_ping_10k", |b| {
        b.iter(|| {
            multitask::run(|| {
                for _ in 0..PINGS {
                    task::yield_now();
                }
            });
        });
    });
}

fn ping_pong_10k(c: &mut Criterion) {
    c.bench_function("ping_pong_10k", |b| {
        b.iter(|| {
            multitask::run(|| {
                task::spawn(|| {
                    for _ in 0..PINGS {
                        task::yield_now();
                    }
                })
                .unwrap();

                for _ in 0..PINGS {
                    task::yield_now();
                }
            });
        });
    });
}

fn rendez_10k_single_threaded(c: &mut Criterion) {
    c.bench_function("rendez_10k_single_threaded", |b| {
        b.iter(|| {
            multitask::run(|| {
                task::spawn(|| {
                    for i in 0..PINGS {
                        rendez(0xbe4c, i);
                    }
                })
                .unwrap();

                for i in 0..PINGS {
                    rendez(0xbe4c, i);
                }
            });
        });
    });
}

fn arendez_1k_multi_threaded(c: &mut Criterion) {
    const EXCHANGES: usize = 1_000;

    c.bench_function("arendez_1k_multi_threaded", |b| {
        b.iter(|| {
            let point = Arc::new(ARendez::new());
            let done = Arc::new(Chan::new(1));

            let (p, d) = (point.clone(), done.clone());
            multitask::spawn_thread(move || {
                for i in 0..EXCHANGES {
                    p.exchange(i);
                }
                d.send(()).unwrap();
            })
            .unwrap();

            multitask::run(move || {
                for i in 0..EXCHANGES {
                    point.exchange(i);
                }
                done.recv().unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    ping_ping_10k,
    ping_pong_10k,
    rendez_10k_single_threaded,
    arendez_1k_multi_threaded
);
criterion_main!(benches);
