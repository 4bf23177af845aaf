//! Invariant Tests
//!
//! Whole-kernel properties: queue ordering, ready-list shape, lock
//! exclusion, frame accounting and demand-paging behaviour. Each module
//! groups the tests for one component.

#[cfg(test)]
mod wait_queue_invariants {
    use crate::kernel::task::TaskId;
    use crate::kernel::waitqueue::WaitQueue;
    use std::collections::VecDeque;

    /// Deterministic pseudo-random sequence
    fn lcg(seed: &mut u64) -> u64 {
        *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        *seed >> 33
    }

    /// Dequeue order is arrival order; length is arrivals - departures
    #[test]
    fn fifo_under_mixed_sequences() {
        for mut seed in 1..20u64 {
            let mut queue = WaitQueue::new(8);
            let mut model = VecDeque::new();
            let (mut arrivals, mut departures) = (0, 0);
            let mut next_id = 0;

            for _ in 0..200 {
                if lcg(&mut seed) % 2 == 0 && model.len() < 8 {
                    queue.push(TaskId(next_id)).unwrap();
                    model.push_back(TaskId(next_id));
                    next_id += 1;
                    arrivals += 1;
                } else if let Some(expected) = model.pop_front() {
                    assert_eq!(queue.pop(), Some(expected));
                    departures += 1;
                }
                assert_eq!(queue.len(), arrivals - departures);
            }
        }
    }
}

#[cfg(test)]
mod ready_list_invariants {
    use crate::kernel::{
        Barrier, Kernel, KernelConfig, KernelState, Lock, MemoryDisk, Semaphore, Step, TaskId,
        TaskState,
    };
    use std::collections::HashSet;
    use std::rc::Rc;

    fn check_ready_list(s: &KernelState) {
        let total = s.tasks.capacity();
        let exited = s.tasks.count(TaskState::Exited);
        let blocked = s.tasks.count(TaskState::Blocked);
        let ready = s.tasks.ready_list();

        assert_eq!(ready.len(), total - exited - blocked);
        assert_eq!(s.tasks.ready_len(), ready.len());

        // One cycle, each member once, links agree both ways
        let unique: HashSet<TaskId> = ready.iter().copied().collect();
        assert_eq!(unique.len(), ready.len());
        for (i, &id) in ready.iter().enumerate() {
            let tcb = s.tasks.tcb(id).unwrap();
            let next = ready[(i + 1) % ready.len()];
            assert_eq!(tcb.next(), next);
            assert_eq!(s.tasks.tcb(next).unwrap().previous(), id);
            assert!(matches!(tcb.state, TaskState::Ready | TaskState::FirstTime));
        }
    }

    /// Ready list size equals total - exited - blocked at every dispatch
    #[test]
    fn ready_list_shape_at_every_step() {
        let kernel = Kernel::boot(KernelConfig::default().with_frames(4), MemoryDisk::new(512, 8), 6).unwrap();
        let lock = Rc::new(Lock::new(&kernel));
        let sem = Rc::new(Semaphore::new(&kernel, 0));
        let barrier = Rc::new(Barrier::new(&kernel, 3));

        for name in ["l1", "l2"] {
            let l = lock.clone();
            kernel
                .spawn_thread(name, move |cx| async move {
                    for _ in 0..3 {
                        l.acquire().await;
                        cx.yield_now().await;
                        l.release();
                    }
                })
                .unwrap();
        }
        for name in ["b1", "b2", "b3"] {
            let b = barrier.clone();
            let s = sem.clone();
            kernel
                .spawn_thread(name, move |cx| async move {
                    b.wait().await;
                    cx.yield_now().await;
                    if name == "b1" {
                        s.down().await;
                    }
                    b.wait().await;
                })
                .unwrap();
        }
        let s = sem.clone();
        kernel
            .spawn_thread("poster", move |cx| async move {
                for _ in 0..4 {
                    cx.yield_now().await;
                }
                s.up();
            })
            .unwrap();

        loop {
            let step = kernel.step().unwrap();
            kernel.inspect(check_ready_list);
            if step == Step::Finished {
                break;
            }
        }
        assert_eq!(kernel.inspect(|s| s.tasks.count(TaskState::Exited)), 6);
    }
}

#[cfg(test)]
mod lock_invariants {
    use crate::kernel::{Condition, Kernel, KernelConfig, Lock, LockStatus, MemoryDisk, TaskId};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn boot(pool: usize) -> Kernel {
        Kernel::boot(KernelConfig::default().with_frames(4), MemoryDisk::new(512, 8), pool).unwrap()
    }

    /// At most one task is between acquire and release
    #[test]
    fn mutual_exclusion() {
        let kernel = boot(4);
        let lock = Rc::new(Lock::new(&kernel));
        let inside = Rc::new(Cell::new(0));
        let entries = Rc::new(Cell::new(0));

        for name in ["a", "b", "c", "d"] {
            let (l, i, e) = (lock.clone(), inside.clone(), entries.clone());
            kernel
                .spawn_thread(name, move |cx| async move {
                    for _ in 0..5 {
                        l.acquire().await;
                        i.set(i.get() + 1);
                        assert_eq!(i.get(), 1);
                        assert_eq!(l.holder(), Some(cx.id()));
                        e.set(e.get() + 1);
                        cx.yield_now().await;
                        i.set(i.get() - 1);
                        l.release();
                        cx.yield_now().await;
                    }
                })
                .unwrap();
        }

        kernel.run().unwrap();
        assert_eq!(entries.get(), 20);
        assert_eq!(lock.status(), LockStatus::Unlocked);
    }

    /// Free lock: immediate. Contended: U blocks, then gets the lock
    /// straight from T; T's own re-acquire cannot steal it.
    #[test]
    fn release_hands_lock_to_first_waiter() {
        let kernel = boot(3);
        let lock = Rc::new(Lock::new(&kernel));
        let owners = Rc::new(RefCell::new(Vec::new()));

        let (l, o) = (lock.clone(), owners.clone());
        kernel
            .spawn_thread("T", move |cx| async move {
                l.acquire().await;
                assert_eq!(l.status(), LockStatus::Locked);
                o.borrow_mut().push(cx.id());
                cx.yield_now().await;
                assert_eq!(l.waiters(), 1);

                l.release();
                assert_eq!(l.status(), LockStatus::Locked);
                assert_eq!(l.holder(), Some(TaskId(1)));

                // Third contender arriving after the release
                l.acquire().await;
                o.borrow_mut().push(cx.id());
                l.release();
            })
            .unwrap();
        let (l, o) = (lock.clone(), owners.clone());
        kernel
            .spawn_thread("U", move |cx| async move {
                l.acquire().await;
                o.borrow_mut().push(cx.id());
                cx.yield_now().await;
                l.release();
            })
            .unwrap();
        let l = lock.clone();
        kernel
            .spawn_thread("V", move |cx| async move {
                cx.yield_now().await;
                assert_eq!(l.status(), LockStatus::Locked);
            })
            .unwrap();

        kernel.run().unwrap();
        assert_eq!(*owners.borrow(), vec![TaskId(0), TaskId(1), TaskId(0)]);
        assert_eq!(lock.status(), LockStatus::Unlocked);
    }

    /// A task waiting on a condition does not hold the lock
    #[test]
    fn condition_wait_releases_lock() {
        let kernel = boot(2);
        let lock = Rc::new(Lock::new(&kernel));
        let cond = Rc::new(Condition::new(&kernel));
        let log = Rc::new(RefCell::new(Vec::new()));

        let (l, c, g) = (lock.clone(), cond.clone(), log.clone());
        kernel
            .spawn_thread("waiter", move |cx| async move {
                l.acquire().await;
                g.borrow_mut().push("waiting");
                c.wait(&l).await;
                assert_eq!(l.holder(), Some(cx.id()));
                g.borrow_mut().push("woken with lock");
                l.release();
            })
            .unwrap();
        let (l, c, g) = (lock.clone(), cond.clone(), log.clone());
        kernel
            .spawn_thread("signaller", move |cx| async move {
                l.acquire().await;
                assert_eq!(l.holder(), Some(cx.id()));
                g.borrow_mut().push("acquired while other waits");
                c.signal();
                l.release();
            })
            .unwrap();

        kernel.run().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["waiting", "acquired while other waits", "woken with lock"]
        );
    }
}

#[cfg(test)]
mod frame_invariants {
    use crate::kernel::error::FrameError;
    use crate::kernel::frame::FrameAllocator;
    use crate::kernel::memory::PhysAddr;

    /// free + used == F after every operation, for small F
    #[test]
    fn free_plus_used_is_constant() {
        for frames in 1..=6 {
            let mut alloc = FrameAllocator::new(PhysAddr(0x10_0000), frames);
            let mut held = Vec::new();
            for round in 0..30 {
                if round % 4 == 3 && !held.is_empty() {
                    let frame = held.remove(0);
                    alloc.release(frame).unwrap();
                } else {
                    let a = alloc.allocate(round % 5 == 0 && held.len() + 1 < frames).unwrap();
                    held.retain(|&f| f != a.frame);
                    held.push(a.frame);
                }
                assert_eq!(alloc.free_count() + alloc.used_count(), frames);
            }
        }
    }

    /// Eviction never picks a pinned frame
    #[test]
    fn eviction_skips_pinned() {
        let mut alloc = FrameAllocator::new(PhysAddr(0x10_0000), 5);
        for i in 0..5 {
            alloc.allocate(i % 2 == 0).unwrap();
        }
        for _ in 0..20 {
            let a = alloc.allocate(false).unwrap();
            assert!(a.evicted);
            assert!(a.frame.0 % 2 == 1);
        }
    }

    /// F = 2: A pins both frames, B's allocation fails without moving
    /// anything
    #[test]
    fn all_pinned_refuses_allocation() {
        let mut alloc = FrameAllocator::new(PhysAddr(0x10_0000), 2);
        alloc.allocate(true).unwrap();
        alloc.allocate(true).unwrap();

        let before = alloc.used_list();
        assert_eq!(alloc.allocate(false), Err(FrameError::AllFramesPinned { frames: 2 }));
        assert_eq!(alloc.used_list(), before);
        assert_eq!(alloc.free_count(), 0);
    }
}

#[cfg(test)]
mod paging_invariants {
    use crate::kernel::config::KernelConfig;
    use crate::kernel::disk::{BlockDevice, MemoryDisk};
    use crate::kernel::fault::FaultStep;
    use crate::kernel::memory::{PAGE_SIZE, VirtAddr};
    use crate::kernel::paging::{Access, Vm};
    use crate::kernel::task::{Backing, TaskId, TaskKind, Tcb};
    use crate::kernel::trace::Tracer;

    /// A fault through directory slot 0 takes table-missing, then
    /// page-missing, then succeeds, with exactly one disk read
    #[test]
    fn directory_zero_fault_sequence() {
        let config = KernelConfig::default().with_frames(8);
        let mut disk = MemoryDisk::new(512, 64);
        // Page 5 of the image starts at sector 1 + 5 * 8
        disk.write(41, 1, &[0x5a; 512]).unwrap();

        let mut tracer = Tracer::new();
        let mut vm = Vm::new(&config, Box::new(disk), &mut tracer).unwrap();

        // A bare directory: nothing in slot 0
        let directory = vm.allocate_frame(true, &mut tracer).unwrap();
        let mut tcb = Tcb::new(TaskId(0), &config);
        tcb.kind = TaskKind::Process;
        tcb.page_directory = Some(directory);
        tcb.backing = Some(Backing {
            location: 1,
            load_base: VirtAddr(0x0030_0000),
        });

        let addr = VirtAddr(0x0030_5010);
        assert_eq!(addr.directory_index(), 0);
        assert_eq!(addr.table_index(), 0x305);

        let access = Access {
            write: false,
            user: true,
        };
        let mut steps = Vec::new();
        for _ in 0..3 {
            match vm.translate(directory, addr, access) {
                Ok(paddr) => {
                    let mut buf = [0u8; 4];
                    assert!(vm.memory().read(paddr, &mut buf));
                    assert_eq!(buf, [0x5a; 4]);
                    steps.push(None);
                }
                Err(code) => {
                    tcb.fault_addr = addr;
                    tcb.error_code = code;
                    steps.push(Some(vm.handle_page_fault(&mut tcb, &mut tracer).unwrap()));
                }
            }
        }

        assert!(matches!(steps[0], Some(FaultStep::TableInstalled { .. })));
        assert!(matches!(steps[1], Some(FaultStep::PageLoaded { sector: 41, .. })));
        assert_eq!(steps[2], None);
        assert_eq!(vm.stats.disk_reads, 1);
        assert_eq!(tcb.accounting.page_fault_count, 2);
    }

    /// Touching a resident page again does not reload it
    #[test]
    fn second_access_does_not_reload() {
        use crate::kernel::{DiskImageBuilder, Kernel, ProcessImage};

        let image = vec![3u8; 2 * PAGE_SIZE];
        let (disk, programs) = DiskImageBuilder::new(512).program(&image, 0).build();
        let config = KernelConfig::default().with_frames(10);
        let base = config.process_load_base;
        let kernel = Kernel::boot(config, disk, 1).unwrap();

        kernel
            .spawn_process("p", ProcessImage::new(programs[0]), move |cx| async move {
                assert_eq!(cx.read_u32(base), 0x0303_0303);
                assert_eq!(cx.read_u32(base + 8), 0x0303_0303);
            })
            .unwrap();
        kernel.run().unwrap();

        let stats = kernel.stats();
        assert_eq!(stats.vm.disk_reads, 1);
        assert_eq!(stats.vm.page_faults, 2);
        assert_eq!(stats.tasks[0].page_faults, 2);
    }
}
