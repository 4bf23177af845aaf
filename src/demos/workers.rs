//! Barrier-stepped workers
//!
//! Every worker adds to a shared total guarded by a binary semaphore, then
//! meets the others at a barrier. Worker 0 reports the round between two
//! barrier waits so nobody starts the next round early.

use super::Transcript;
use crate::kernel::{Barrier, Kernel, KernelResult, Semaphore};
use std::cell::Cell;
use std::rc::Rc;

pub const WORKERS: usize = 4;
const ROUNDS: u32 = 3;

pub fn spawn(kernel: &Kernel, transcript: &Transcript) -> KernelResult<()> {
    let barrier = Rc::new(Barrier::new(kernel, WORKERS));
    let mutex = Rc::new(Semaphore::new(kernel, 1));
    let total = Rc::new(Cell::new(0u32));

    for w in 0..WORKERS {
        let (barrier, mutex, total) = (barrier.clone(), mutex.clone(), total.clone());
        let out = transcript.clone();
        kernel.spawn_thread(&format!("worker-{}", w), move |cx| async move {
            for round in 1..=ROUNDS {
                mutex.down().await;
                let seen = total.get();
                // Hold the semaphore across a yield
                cx.yield_now().await;
                total.set(seen + round * (w as u32 + 1));
                mutex.up();

                barrier.wait().await;
                if w == 0 {
                    out.push(format!("round {}: total {}", round, total.get()));
                }
                barrier.wait().await;
            }
        })?;
    }
    Ok(())
}
