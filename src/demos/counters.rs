//! Counter threads
//!
//! Each thread counts up and yields after every step, so the transcript
//! interleaves them in ready-list order.

use super::Transcript;
use crate::kernel::{Kernel, KernelResult};

pub const COUNTERS: usize = 3;
const COUNT_TO: u32 = 5;

pub fn spawn(kernel: &Kernel, transcript: &Transcript) -> KernelResult<()> {
    for i in 0..COUNTERS {
        let out = transcript.clone();
        kernel.spawn_thread(&format!("counter-{}", i), move |cx| async move {
            for n in 1..=COUNT_TO {
                out.push(format!("counter {}: {}", i, n));
                cx.yield_now().await;
            }
            // The last counter leaves explicitly instead of returning
            if i == COUNTERS - 1 {
                out.push(format!("counter {}: done", i));
                cx.exit().await;
            }
        })?;
    }
    Ok(())
}
