mod common;

use common::{Env, setup, setup_with};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use ze_rs::error::ZE_RESULT_NOT_READY;
use ze_rs::runtime::cmdlist::{CopyRegion, Surface};
use ze_rs::runtime::event::KERNEL_TIMESTAMP_RESULT_SIZE;
use ze_rs::runtime::memory::{MemFreePolicy, MemoryAdvice};
use ze_rs::runtime::memory::virtual_mem::PhysicalMemoryDesc;
use ze_rs::utils::{KIB, MIB};
use ze_rs::{
    AccessAttribute, CommandList, CommandListDesc, CommandQueueDesc, CommandQueueMode,
    DeviceConfig, DriverConfig, Event, EventDesc, EventPool, EventPoolDesc, EventPoolFlags,
    EventScopeFlags, FenceDesc, HwFamily, INFINITE_TIMEOUT, ImmediateCommandList, ZeError,
};

fn events(env: &Env, count: u32, flags: EventPoolFlags) -> Vec<Arc<Event>> {
    let pool = EventPool::create(&env.context, &EventPoolDesc { count, flags }).unwrap();
    (0..count)
        .map(|index| {
            Event::create(
                &pool,
                &EventDesc {
                    index,
                    signal: EventScopeFlags::HOST,
                    wait: EventScopeFlags::HOST,
                },
            )
            .unwrap()
        })
        .collect()
}

/// A closed list that fills `ptr` only after `gate` is signaled.
fn gated_fill(env: &Env, gate: &Arc<Event>, ptr: u64, size: u64) -> CommandList {
    let mut list = env.list();
    list.append_memory_fill(ptr, &[0x5A], size, None, &[gate])
        .unwrap();
    list.close().unwrap();
    list
}

// ===============================================================================================
// Usage errors
// ===============================================================================================

#[test]
fn open_list_is_rejected() {
    let env = setup();
    let queue = env.queue(CommandQueueMode::Asynchronous);
    let list = env.list();
    assert!(matches!(
        queue.execute_command_lists(&[&list], None),
        Err(ZeError::InvalidArgument(_))
    ));
}

#[test]
fn synchronize_before_any_submission() {
    let env = setup();
    let queue = env.queue(CommandQueueMode::Asynchronous);
    assert!(matches!(
        queue.synchronize(0),
        Err(ZeError::InvalidState(_))
    ));
}

#[test]
fn append_after_close_is_invalid_state() {
    let env = setup();
    let mut list = env.list();
    list.close().unwrap();
    let err = list.append_barrier(None, &[]).unwrap_err();
    assert!(matches!(err, ZeError::InvalidState(_)));
    assert_eq!(err.code(), ZE_RESULT_NOT_READY);
    assert!(matches!(list.close(), Err(ZeError::InvalidState(_))));
}

#[test]
fn list_family_must_match_queue() {
    let env = setup();
    let queue = env.queue(CommandQueueMode::Asynchronous);
    let mut list = env.copy_list();
    list.close().unwrap();
    assert!(matches!(
        queue.execute_command_lists(&[&list], None),
        Err(ZeError::InvalidArgument(_))
    ));
}

#[test]
fn foreign_memory_is_rejected_at_append() {
    let env = setup();
    let mut list = env.list();
    assert!(matches!(
        list.append_memory_fill(0xdead_0000, &[1], 16, None, &[]),
        Err(ZeError::InvalidArgument(_))
    ));
    assert_eq!(list.encoded_len(), 0);
}

// ===============================================================================================
// Residency
// ===============================================================================================

#[test]
fn residency_exhaustion_fails_without_submitting() {
    let env = setup_with(
        DriverConfig::empty().with_device(DeviceConfig::new(HwFamily::Gen12Lp).local_memory(MIB)),
    );
    let a = env.device_alloc(768 * KIB);
    let b = env.device_alloc(768 * KIB);
    env.context
        .make_memory_resident(&env.device, a, 768 * KIB)
        .unwrap();
    assert_eq!(env.device.resident_bytes(), 768 * KIB);

    let mut list = env.list();
    list.append_memory_fill(b, &[1], 768 * KIB, None, &[])
        .unwrap();
    list.close().unwrap();

    let queue = env.queue(CommandQueueMode::Synchronous);
    assert_eq!(
        queue.execute_command_lists(&[&list], None),
        Err(ZeError::OutOfDeviceMemory)
    );
    assert!(matches!(queue.synchronize(0), Err(ZeError::InvalidState(_))));
    let b_alloc = env.context.get_allocation(b).unwrap();
    assert!(!env.device.is_resident(&b_alloc));

    env.context.evict_memory(&env.device, a, 768 * KIB).unwrap();
    queue.execute_command_lists(&[&list], None).unwrap();
    assert!(env.device.is_resident(&b_alloc));
    assert_eq!(env.device.resident_bytes(), 768 * KIB);
}

#[test]
fn idle_implicit_residency_is_evicted_for_new_work() {
    let env = setup_with(
        DriverConfig::empty().with_device(DeviceConfig::new(HwFamily::Gen12Lp).local_memory(MIB)),
    );
    let a = env.device_alloc(768 * KIB);
    let b = env.device_alloc(768 * KIB);
    let queue = env.queue(CommandQueueMode::Synchronous);

    for ptr in [a, b] {
        let mut list = env.list();
        list.append_memory_fill(ptr, &[9], 768 * KIB, None, &[])
            .unwrap();
        list.close().unwrap();
        queue.execute_command_lists(&[&list], None).unwrap();
    }
    let a_alloc = env.context.get_allocation(a).unwrap();
    let b_alloc = env.context.get_allocation(b).unwrap();
    assert!(!env.device.is_resident(&a_alloc));
    assert!(env.device.is_resident(&b_alloc));
}

// ===============================================================================================
// Device loss
// ===============================================================================================

#[test]
fn protection_fault_loses_the_device() {
    let env = setup();
    let ctx = &env.context;
    let page = ctx.granularity();
    let reservation = ctx.reserve_virtual_memory(None, page).unwrap();
    let physical = ctx
        .create_physical_memory(&env.device, &PhysicalMemoryDesc { size: page })
        .unwrap();
    ctx.map_virtual_memory(&reservation, 0, page, &physical, 0, AccessAttribute::ReadWrite)
        .unwrap();
    ctx.set_access_attribute(reservation.base, page, AccessAttribute::ReadOnly)
        .unwrap();

    let mut list = env.list();
    list.append_memory_fill(reservation.base, &[0xFF], page, None, &[])
        .unwrap();
    list.close().unwrap();
    let queue = env.queue(CommandQueueMode::Synchronous);
    assert_eq!(
        queue.execute_command_lists(&[&list], None),
        Err(ZeError::DeviceLost)
    );

    assert!(env.device.is_lost());
    assert_eq!(queue.synchronize(0), Err(ZeError::DeviceLost));
    assert_eq!(
        queue.execute_command_lists(&[&list], None),
        Err(ZeError::DeviceLost)
    );
    assert_eq!(
        CommandList::create(ctx, &env.device, &CommandListDesc::default()).unwrap_err(),
        ZeError::DeviceLost
    );
    assert_eq!(
        ctx.reserve_virtual_memory(None, page).unwrap_err(),
        ZeError::DeviceLost
    );
}

// ===============================================================================================
// Events and fences
// ===============================================================================================

#[test]
fn compute_queue_waits_for_copy_queue_signal() {
    let env = setup();
    let evs = events(&env, 1, EventPoolFlags::HOST_VISIBLE);
    let handoff = &evs[0];
    let src = env.host_alloc(0x1000);
    let mid = env.host_alloc(0x1000);
    let dst = env.host_alloc(0x1000);
    env.context.write_memory(src, &[0x42; 0x1000]).unwrap();

    let mut consumer = env.list();
    consumer
        .append_memory_copy(dst, mid, 0x1000, None, &[handoff])
        .unwrap();
    consumer.close().unwrap();
    let compute = env.queue(CommandQueueMode::Asynchronous);
    compute.execute_command_lists(&[&consumer], None).unwrap();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(compute.synchronize(0), Err(ZeError::NotReady));

    let mut producer = env.copy_list();
    producer
        .append_memory_copy(mid, src, 0x1000, Some(handoff), &[])
        .unwrap();
    producer.close().unwrap();
    let copy = env.copy_queue(CommandQueueMode::Asynchronous);
    copy.execute_command_lists(&[&producer], None).unwrap();

    compute.synchronize(INFINITE_TIMEOUT).unwrap();
    assert!(env.read(dst, 0x1000).iter().all(|&b| b == 0x42));
}

#[test]
fn host_signal_releases_gpu_wait() {
    let env = setup();
    let evs = events(&env, 1, EventPoolFlags::HOST_VISIBLE);
    let buf = env.host_alloc(0x1000);
    let list = gated_fill(&env, &evs[0], buf, 0x1000);
    let queue = env.queue(CommandQueueMode::Asynchronous);
    queue.execute_command_lists(&[&list], None).unwrap();

    assert_eq!(queue.synchronize(1_000_000), Err(ZeError::NotReady));
    evs[0].host_signal().unwrap();
    queue.synchronize(INFINITE_TIMEOUT).unwrap();
    assert_eq!(env.read(buf, 4), vec![0x5A; 4]);
}

#[test]
fn fence_must_be_reset_before_reuse() {
    let env = setup();
    let queue = env.queue(CommandQueueMode::Asynchronous);
    let fence = queue.create_fence(&FenceDesc::default());
    assert!(matches!(
        fence.host_synchronize(0),
        Err(ZeError::InvalidState(_))
    ));

    let mut list = env.list();
    list.append_barrier(None, &[]).unwrap();
    list.close().unwrap();
    queue.execute_command_lists(&[&list], Some(&fence)).unwrap();
    fence.host_synchronize(INFINITE_TIMEOUT).unwrap();

    assert!(matches!(
        queue.execute_command_lists(&[&list], Some(&fence)),
        Err(ZeError::InvalidState(_))
    ));
    fence.reset().unwrap();
    assert_eq!(fence.query_status(), Err(ZeError::NotReady));
    queue.execute_command_lists(&[&list], Some(&fence)).unwrap();
    fence.host_synchronize(INFINITE_TIMEOUT).unwrap();
}

#[test]
fn fence_of_another_queue_is_rejected() {
    let env = setup();
    let first = env.queue(CommandQueueMode::Asynchronous);
    let second = env.queue(CommandQueueMode::Asynchronous);
    let fence = first.create_fence(&FenceDesc::default());
    let mut list = env.list();
    list.close().unwrap();
    assert!(matches!(
        second.execute_command_lists(&[&list], Some(&fence)),
        Err(ZeError::InvalidArgument(_))
    ));
}

#[test]
fn signaled_fence_starts_ready() {
    let env = setup();
    let queue = env.queue(CommandQueueMode::Asynchronous);
    let fence = queue.create_fence(&FenceDesc { signaled: true });
    assert_eq!(fence.query_status(), Ok(()));
    fence.host_synchronize(0).unwrap();
}

#[test]
fn in_flight_fence_and_event_cannot_be_reset() {
    let env = setup();
    let evs = events(&env, 2, EventPoolFlags::HOST_VISIBLE);
    let (gate, done) = (&evs[0], &evs[1]);
    let buf = env.host_alloc(0x1000);

    let mut list = env.list();
    list.append_memory_fill(buf, &[1], 0x1000, Some(done), &[gate])
        .unwrap();
    list.close().unwrap();
    let queue = env.queue(CommandQueueMode::Asynchronous);
    let fence = queue.create_fence(&FenceDesc::default());
    queue.execute_command_lists(&[&list], Some(&fence)).unwrap();

    assert!(matches!(fence.reset(), Err(ZeError::InvalidState(_))));
    assert!(matches!(done.host_reset(), Err(ZeError::InvalidState(_))));
    assert_eq!(done.query_status(), Err(ZeError::NotReady));

    gate.host_signal().unwrap();
    fence.host_synchronize(INFINITE_TIMEOUT).unwrap();
    done.host_synchronize(INFINITE_TIMEOUT).unwrap();
    fence.reset().unwrap();
    done.host_reset().unwrap();
    assert_eq!(done.query_status(), Err(ZeError::NotReady));
}

#[test]
fn event_written_by_two_queues_resets_after_both() {
    let env = setup();
    let evs = events(&env, 2, EventPoolFlags::HOST_VISIBLE);
    let (gate, shared) = (&evs[0], &evs[1]);
    let src = env.host_alloc(0x1000);
    let dst = env.host_alloc(0x1000);

    let mut slow = env.copy_list();
    slow.append_memory_copy(dst, src, 0x1000, Some(shared), &[gate])
        .unwrap();
    slow.close().unwrap();
    let copy = env.copy_queue(CommandQueueMode::Asynchronous);
    copy.execute_command_lists(&[&slow], None).unwrap();

    let mut fast = env.list();
    fast.append_signal_event(shared).unwrap();
    fast.close().unwrap();
    let compute = env.queue(CommandQueueMode::Asynchronous);
    compute.execute_command_lists(&[&fast], None).unwrap();
    compute.synchronize(INFINITE_TIMEOUT).unwrap();
    assert_eq!(shared.query_status(), Ok(()));

    assert!(matches!(shared.host_reset(), Err(ZeError::InvalidState(_))));

    gate.host_signal().unwrap();
    copy.synchronize(INFINITE_TIMEOUT).unwrap();
    shared.host_reset().unwrap();
    assert_eq!(shared.query_status(), Err(ZeError::NotReady));
}

#[test]
fn gpu_event_reset_clears_the_signal() {
    let env = setup();
    let evs = events(&env, 1, EventPoolFlags::HOST_VISIBLE);
    evs[0].host_signal().unwrap();

    let mut list = env.list();
    list.append_event_reset(&evs[0]).unwrap();
    list.close().unwrap();
    env.queue(CommandQueueMode::Synchronous)
        .execute_command_lists(&[&list], None)
        .unwrap();
    assert_eq!(evs[0].query_status(), Err(ZeError::NotReady));
}

#[test]
fn kernel_timestamps_are_captured_and_copied() {
    let env = setup();
    let evs = events(&env, 1, EventPoolFlags::HOST_VISIBLE | EventPoolFlags::KERNEL_TIMESTAMP);
    let event = &evs[0];
    assert_eq!(event.query_kernel_timestamp(), Err(ZeError::NotReady));

    let out = env.host_alloc(0x1000);
    let report = env.host_alloc(0x1000);
    let mut kernel = env.kernel("iota");
    kernel.set_argument_buffer(0, out).unwrap();
    kernel.set_argument_value(1, &1u32.to_le_bytes()).unwrap();
    kernel.set_group_size(32, 1, 1).unwrap();

    let mut list = env.list();
    list.append_launch_kernel(&kernel, [8, 1, 1], Some(event), &[])
        .unwrap();
    list.append_query_kernel_timestamps(&[event], report, None, &[])
        .unwrap();
    list.close().unwrap();
    env.queue(CommandQueueMode::Synchronous)
        .execute_command_lists(&[&list], None)
        .unwrap();

    let ts = event.query_kernel_timestamp().unwrap();
    assert!(ts.global.kernel_start <= ts.global.kernel_end);
    assert!(ts.context.kernel_start <= ts.context.kernel_end);
    assert_eq!(
        ts.duration(),
        ts.context.kernel_end - ts.context.kernel_start
    );

    let raw = env.read(report, KERNEL_TIMESTAMP_RESULT_SIZE as usize);
    let word = |i: usize| u64::from_le_bytes(raw[i * 8..i * 8 + 8].try_into().unwrap());
    let mask = env.device.kernel_timestamp_mask();
    assert_eq!(word(0) & mask, ts.global.kernel_start);
    assert_eq!(word(1) & mask, ts.global.kernel_end);
    assert_eq!(word(2) & mask, ts.context.kernel_start);
    assert_eq!(word(3) & mask, ts.context.kernel_end);
}

#[test]
fn timestamps_need_a_timestamp_pool() {
    let env = setup();
    let evs = events(&env, 1, EventPoolFlags::HOST_VISIBLE);
    evs[0].host_signal().unwrap();
    assert!(matches!(
        evs[0].query_kernel_timestamp(),
        Err(ZeError::UnsupportedFeature(_))
    ));

    let report = env.host_alloc(0x1000);
    let mut list = env.list();
    assert!(matches!(
        list.append_query_kernel_timestamps(&[&evs[0]], report, None, &[]),
        Err(ZeError::UnsupportedFeature(_))
    ));
}

// ===============================================================================================
// Memory lifetime
// ===============================================================================================

#[test]
fn free_of_busy_allocation_is_deferred() {
    let env = setup();
    let evs = events(&env, 1, EventPoolFlags::HOST_VISIBLE);
    let buf = env.host_alloc(0x1000);
    let list = gated_fill(&env, &evs[0], buf, 0x1000);
    let queue = env.queue(CommandQueueMode::Asynchronous);
    queue.execute_command_lists(&[&list], None).unwrap();

    env.context.mem_free(buf).unwrap();
    assert_eq!(env.context.deferred_free_count(), 1);
    assert!(env.context.get_allocation(buf).is_none());
    assert!(matches!(
        env.context.mem_free(buf),
        Err(ZeError::InvalidArgument(_))
    ));

    evs[0].host_signal().unwrap();
    queue.synchronize(INFINITE_TIMEOUT).unwrap();
    assert_eq!(env.context.deferred_free_count(), 0);
}

#[test]
fn blocking_free_waits_for_the_gpu() {
    let env = setup();
    let evs = events(&env, 1, EventPoolFlags::HOST_VISIBLE);
    let buf = env.device_alloc(0x1000);
    let list = gated_fill(&env, &evs[0], buf, 0x1000);
    let queue = env.queue(CommandQueueMode::Asynchronous);
    queue.execute_command_lists(&[&list], None).unwrap();

    let gate = evs[0].clone();
    let signaler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        gate.host_signal().unwrap();
    });
    env.context
        .mem_free_ext(buf, MemFreePolicy::BlockingFree)
        .unwrap();
    assert_eq!(env.context.deferred_free_count(), 0);
    assert_eq!(evs[0].query_status(), Ok(()));
    signaler.join().unwrap();
    queue.synchronize(INFINITE_TIMEOUT).unwrap();
}

// ===============================================================================================
// Engines and operations
// ===============================================================================================

#[test]
fn copy_engine_restrictions() {
    let env = setup();
    let buf = env.device_alloc(0x1000);
    let mut list = env.copy_list();

    assert!(matches!(
        list.append_memory_fill(buf, &[1, 2, 3], 0x1000, None, &[]),
        Err(ZeError::UnsupportedFeature(_))
    ));
    assert!(matches!(
        list.append_memory_fill(buf, &[0; 8], 0x1000, None, &[]),
        Err(ZeError::UnsupportedFeature(_))
    ));
    assert_eq!(list.encoded_len(), 0);

    let mut kernel = env.kernel("poke");
    kernel.set_argument_buffer(0, buf).unwrap();
    assert!(matches!(
        list.append_launch_kernel(&kernel, [1, 1, 1], None, &[]),
        Err(ZeError::UnsupportedFeature(_))
    ));
    assert_eq!(list.referenced_memory_count(), 0);

    list.append_memory_fill(buf, &[1, 2, 3, 4], 0x1000, None, &[])
        .unwrap();
    assert_eq!(list.referenced_memory_count(), 1);
}

#[test]
fn compute_fill_pattern_limits() {
    let env = setup();
    let buf = env.device_alloc(0x1000);
    let mut list = env.list();
    assert!(matches!(
        list.append_memory_fill(buf, &[], 0x1000, None, &[]),
        Err(ZeError::InvalidSize(_))
    ));
    assert!(matches!(
        list.append_memory_fill(buf, &[0; 129], 0x1000, None, &[]),
        Err(ZeError::InvalidSize(_))
    ));
    list.append_memory_fill(buf, &[0; 128], 0x1000, None, &[])
        .unwrap();
}

#[test]
fn gen9_has_no_copy_group() {
    let env = setup_with(DriverConfig::empty().with_device(DeviceConfig::new(HwFamily::Gen9)));
    assert_eq!(env.device.command_queue_groups().len(), 1);
    assert!(matches!(
        CommandList::create(
            &env.context,
            &env.device,
            &CommandListDesc {
                command_queue_group_ordinal: 1
            }
        ),
        Err(ZeError::InvalidArgument(_))
    ));
}

#[test]
fn kernel_dispatch_writes_every_item() {
    let env = setup();
    let out = env.host_alloc(0x1000);
    let mut kernel = env.kernel("iota");
    kernel.set_argument_buffer(0, out).unwrap();

    let mut list = env.list();
    assert!(matches!(
        list.append_launch_kernel(&kernel, [1, 1, 1], None, &[]),
        Err(ZeError::InvalidArgument(_))
    ));

    kernel.set_argument_value(1, &5u32.to_le_bytes()).unwrap();
    let group = kernel.suggest_group_size([256, 1, 1]).unwrap();
    kernel.set_group_size(group[0], group[1], group[2]).unwrap();
    assert!(matches!(
        list.append_launch_kernel_for_global_size(&kernel, [250, 1, 1], None, &[]),
        Err(ZeError::InvalidGroupSizeDimension)
    ));
    list.append_launch_kernel_for_global_size(&kernel, [256, 1, 1], None, &[])
        .unwrap();
    list.close().unwrap();

    env.queue(CommandQueueMode::Synchronous)
        .execute_command_lists(&[&list], None)
        .unwrap();
    let raw = env.read(out, 256 * 4);
    for (i, chunk) in raw.chunks_exact(4).enumerate() {
        let value = u32::from_le_bytes(chunk.try_into().unwrap());
        assert_eq!(value, 5 * i as u32);
    }
}

#[test]
fn kernel_buffer_spanning_two_physical_objects() {
    let env = setup();
    let ctx = &env.context;
    let page = ctx.granularity();
    let reservation = ctx.reserve_virtual_memory(None, 2 * page).unwrap();
    let desc = PhysicalMemoryDesc { size: page };
    let low = ctx.create_physical_memory(&env.device, &desc).unwrap();
    let high = ctx.create_physical_memory(&env.device, &desc).unwrap();
    for (offset, physical) in [(0, &low), (page, &high)] {
        ctx.map_virtual_memory(
            &reservation,
            offset,
            page,
            physical,
            0,
            AccessAttribute::ReadWrite,
        )
        .unwrap();
    }

    let buf = reservation.base + page - 16;
    let mut kernel = env.kernel("iota");
    kernel.set_argument_buffer(0, buf).unwrap();
    kernel.set_argument_value(1, &1u32.to_le_bytes()).unwrap();
    kernel.set_group_size(16, 1, 1).unwrap();
    let host = env.host_alloc(0x1000);

    let mut list = env.list();
    list.append_launch_kernel(&kernel, [1, 1, 1], None, &[])
        .unwrap();
    assert_eq!(list.referenced_memory_count(), 2);
    list.append_barrier(None, &[]).unwrap();
    list.append_memory_copy(host, buf, 64, None, &[]).unwrap();
    list.close().unwrap();

    env.queue(CommandQueueMode::Synchronous)
        .execute_command_lists(&[&list], None)
        .unwrap();
    let out = env.read(host, 64);
    for (i, word) in out.chunks_exact(4).enumerate() {
        assert_eq!(u32::from_le_bytes(word.try_into().unwrap()), i as u32);
    }
}

#[test]
fn region_copy_moves_a_box() {
    let env = setup();
    let src = env.host_alloc(0x1000);
    let dst = env.host_alloc(0x1000);
    let pattern: Vec<u8> = (0..128u8).collect();
    env.context.write_memory(src, &pattern).unwrap();

    let src_region = CopyRegion {
        origin_x: 4,
        origin_y: 1,
        origin_z: 0,
        width: 8,
        height: 2,
        depth: 1,
    };
    let dst_region = CopyRegion {
        origin_x: 0,
        origin_y: 0,
        ..src_region
    };

    let mut list = env.list();
    list.append_memory_copy_region(
        Surface {
            ptr: dst,
            pitch: 16,
            slice_pitch: 0,
        },
        &dst_region,
        Surface {
            ptr: src,
            pitch: 32,
            slice_pitch: 0,
        },
        &src_region,
        None,
        &[],
    )
    .unwrap();
    list.close().unwrap();
    env.queue(CommandQueueMode::Synchronous)
        .execute_command_lists(&[&list], None)
        .unwrap();

    let out = env.read(dst, 32);
    assert_eq!(&out[..8], &pattern[36..44]);
    assert_eq!(&out[16..24], &pattern[68..76]);
    assert_eq!(&out[8..16], &[0; 8]);
}

#[test]
fn region_copy_rejects_overflowing_surfaces() {
    let env = setup();
    let dst = env.host_alloc(0x1000);
    let region = CopyRegion {
        origin_x: 100,
        origin_y: 0,
        origin_z: 0,
        width: 8,
        height: 1,
        depth: 1,
    };
    let surface = |ptr| Surface {
        ptr,
        pitch: 16,
        slice_pitch: 0,
    };

    let mut list = env.list();
    let empty = list.encoded_len();
    assert!(matches!(
        list.append_memory_copy_region(
            surface(dst),
            &region,
            surface(u64::MAX - 8),
            &region,
            None,
            &[],
        ),
        Err(ZeError::InvalidArgument(_))
    ));

    let two_rows = CopyRegion {
        origin_x: 0,
        height: 2,
        ..region
    };
    let near_top = Surface {
        ptr: u64::MAX - 0x1000,
        pitch: 0x1000,
        slice_pitch: 0,
    };
    assert!(matches!(
        list.append_memory_copy_region(near_top, &two_rows, near_top, &two_rows, None, &[]),
        Err(ZeError::InvalidArgument(_))
    ));
    assert_eq!(list.encoded_len(), empty);
    assert_eq!(list.referenced_memory_count(), 0);
}

#[test]
fn immediate_list_submits_each_append() {
    let env = setup();
    let buf = env.host_alloc(0x1000);
    let mut immediate = ImmediateCommandList::create(
        &env.context,
        &env.device,
        &CommandQueueDesc {
            mode: CommandQueueMode::Synchronous,
            ..CommandQueueDesc::default()
        },
    )
    .unwrap();

    immediate
        .append(|list| list.append_memory_fill(buf, &[0x11], 0x1000, None, &[]))
        .unwrap();
    assert!(env.read(buf, 0x1000).iter().all(|&b| b == 0x11));

    assert!(
        immediate
            .append(|list| list.append_memory_fill(buf, &[], 0x1000, None, &[]))
            .is_err()
    );
    immediate
        .append(|list| list.append_memory_fill(buf, &[0x22, 0x33], 0x1000, None, &[]))
        .unwrap();
    immediate.synchronize(INFINITE_TIMEOUT).unwrap();
    assert_eq!(env.read(buf, 4), vec![0x22, 0x33, 0x22, 0x33]);
}

#[test]
fn zero_size_operations_and_hints() {
    let env = setup();
    let buf = env.host_alloc(0x2000);
    let mut list = env.list();
    let empty = list.encoded_len();

    list.append_memory_fill(buf, &[0x5A], 0, None, &[]).unwrap();
    list.append_memory_copy(buf + 0x1000, buf, 0, None, &[])
        .unwrap();
    list.append_memory_prefetch(buf, 0).unwrap();
    assert_eq!(list.encoded_len(), empty);
    assert_eq!(list.referenced_memory_count(), 0);

    list.append_memory_prefetch(buf, 0x2000).unwrap();
    list.append_mem_advise(&env.device, buf, 0x1000, MemoryAdvice::SetReadMostly)
        .unwrap();
    assert!(list.encoded_len() > empty);
    assert_eq!(list.referenced_memory_count(), 1);
    assert!(matches!(
        list.append_memory_prefetch(0xdead_0000, 0x1000),
        Err(ZeError::InvalidArgument(_))
    ));

    list.append_memory_fill(buf, &[0x5A], 0x2000, None, &[])
        .unwrap();
    list.close().unwrap();
    env.queue(CommandQueueMode::Synchronous)
        .execute_command_lists(&[&list], None)
        .unwrap();
    assert!(env.read(buf, 0x2000).iter().all(|&b| b == 0x5A));
}

#[test]
fn queue_index_must_exist() {
    let env = setup();
    let groups = env.device.command_queue_groups();
    let err = ze_rs::CommandQueueBuilder::new(&env.context, &env.device)
        .with_index(groups[0].num_queues)
        .create()
        .unwrap_err();
    assert!(matches!(err, ZeError::InvalidArgument(_)));
}
