//! Dining philosophers
//!
//! Three philosophers and three forks, so at most one eats at a time. A
//! hungry philosopher waits on its own condition until both neighbours are
//! done; a philosopher that finishes eating signals both neighbours.

use super::Transcript;
use crate::kernel::{Condition, Kernel, KernelResult, Lock, halt};
use std::cell::RefCell;
use std::rc::Rc;

pub const PHILOSOPHERS: usize = 3;
const MEALS: u32 = 4;

struct Table {
    lock: Lock,
    hungry: Vec<Condition>,
    eating: RefCell<[bool; PHILOSOPHERS]>,
}

impl Table {
    fn neighbours(i: usize) -> (usize, usize) {
        ((i + PHILOSOPHERS - 1) % PHILOSOPHERS, (i + 1) % PHILOSOPHERS)
    }

    fn may_eat(&self, i: usize) -> bool {
        let (left, right) = Self::neighbours(i);
        let eating = self.eating.borrow();
        !eating[left] && !eating[right]
    }
}

pub fn spawn(kernel: &Kernel, transcript: &Transcript) -> KernelResult<()> {
    let table = Rc::new(Table {
        lock: Lock::new(kernel),
        hungry: (0..PHILOSOPHERS).map(|_| Condition::new(kernel)).collect(),
        eating: RefCell::new([false; PHILOSOPHERS]),
    });

    for i in 0..PHILOSOPHERS {
        let (t, out) = (table.clone(), transcript.clone());
        kernel.spawn_thread(&format!("philosopher-{}", i), move |cx| async move {
            let (left, right) = Table::neighbours(i);
            for meal in 1..=MEALS {
                // Think for a while
                for _ in 0..=(i + meal as usize) % 3 {
                    cx.yield_now().await;
                }

                t.lock.acquire().await;
                while !t.may_eat(i) {
                    t.hungry[i].wait(&t.lock).await;
                }
                t.eating.borrow_mut()[i] = true;
                if t.eating.borrow().iter().filter(|&&e| e).count() != 1 {
                    halt(format_args!("philosopher {} eats next to a neighbour", i));
                }
                t.lock.release();

                out.push(format!("philosopher {} eats meal {}", i, meal));
                cx.yield_now().await;

                t.lock.acquire().await;
                t.eating.borrow_mut()[i] = false;
                t.hungry[left].signal();
                t.hungry[right].signal();
                t.lock.release();
            }
            out.push(format!("philosopher {} is full", i));
        })?;
    }
    Ok(())
}
