mod common;

use common::{Fixture, GPU_ID, MM, MockAllocator, MockScheduler, test_config};
use kfd_mem::error::KfdMemError;
use kfd_mem::kfd::bo::{BoAllocator, BoCreateInfo, BoDomain, BoKind};
use kfd_mem::kfd::device::KfdDevice;
use kfd_mem::kfd::host::MmId;
use kfd_mem::thunk::memory::restore::{evict_mem, flush_restore, schedule_restore_mem};
use kfd_mem::thunk::memory::userptr::MnKind;
use kfd_mem::thunk::memory::{AllocFlags, MemDomain, MemoryManager};
use std::sync::Arc;
use std::time::Duration;

const HOST: u64 = 0x7f00_0000_0000;

#[test]
fn host_change_evicts_and_restores() {
    let fx = Fixture::new();
    let mem = fx.alloc_userptr(0x1000, 0x2000, HOST);
    assert_eq!(fx.host.calls(), 1);
    let pages = fx.alloc.bo(mem.bo).unwrap().user_pages;
    assert!(!pages.is_empty());

    fx.manager.map(&mem, &fx.vm).unwrap();
    assert_eq!(fx.host.calls(), 1);
    assert!(fx.vm.is_mapped_in_hw(0x1000));

    let notifier = fx.manager.notifier();
    notifier.invalidate_range_start(MM, HOST + 0x1000, HOST + 0x2000);
    assert_eq!(mem.eviction_count(), 2);
    assert!(!fx.vm.is_mapped_in_hw(0x1000));
    assert!(mem.mappings()[0].is_mapped);

    notifier.invalidate_range_end(MM, HOST + 0x1000, HOST + 0x2000);
    flush_restore(&mem);

    assert_eq!(mem.eviction_count(), 0);
    assert!(fx.vm.is_mapped_in_hw(0x1000));
    assert_eq!(fx.host.calls(), 2);
    assert_ne!(fx.alloc.bo(mem.bo).unwrap().user_pages, pages);
}

#[test]
fn unrelated_ranges_are_ignored() {
    let fx = Fixture::new();
    let mem = fx.alloc_userptr(0x1000, 0x2000, HOST);
    fx.manager.map(&mem, &fx.vm).unwrap();

    let notifier = fx.manager.notifier();
    notifier.invalidate_range_start(MM, HOST + 0x2000, HOST + 0x3000);
    notifier.invalidate_range_start(MmId(1), HOST, HOST + 0x1000);
    notifier.invalidate_range_start(MM, HOST - 0x1000, HOST);

    assert_eq!(mem.eviction_count(), 0);
    assert!(fx.vm.is_mapped_in_hw(0x1000));
}

#[test]
fn eviction_while_faulting_cancels_the_restore() {
    let fx = Fixture::new();
    let mem = fx.alloc_userptr(0x1000, 0x1000, HOST);
    fx.manager.map(&mem, &fx.vm).unwrap();

    let notifier = fx.manager.notifier();
    notifier.invalidate_range_start(MM, HOST, HOST + 0x1000);

    let racer = Arc::clone(&mem);
    fx.host.on_next_fault(move || evict_mem(&racer, MM).unwrap());
    notifier.invalidate_range_end(MM, HOST, HOST + 0x1000);
    flush_restore(&mem);

    assert_eq!(fx.host.calls(), 2);
    assert_eq!(mem.eviction_count(), 2);
    assert!(!fx.vm.is_mapped_in_hw(0x1000));
    assert_eq!(fx.sched.resume_calls(), 0);
    assert_eq!(fx.alloc.total_pins(), 0);

    // The pages fetched by the interrupted restore are still current.
    schedule_restore_mem(&mem, MM, Duration::ZERO).unwrap();
    flush_restore(&mem);
    assert_eq!(mem.eviction_count(), 0);
    assert!(fx.vm.is_mapped_in_hw(0x1000));
    assert_eq!(fx.host.calls(), 2);
    assert_eq!(fx.sched.resume_calls(), 1);
}

#[test]
fn stale_pages_are_fetched_at_map() {
    let fx = Fixture::new();
    let mem = fx.alloc_userptr(0x1000, 0x1000, HOST);

    fx.host.set_fail(true);
    let notifier = fx.manager.notifier();
    notifier.invalidate_range_start(MM, HOST, HOST + 0x1000);
    notifier.invalidate_range_end(MM, HOST, HOST + 0x1000);
    flush_restore(&mem);
    assert_eq!(mem.eviction_count(), 0);

    assert!(matches!(
        fx.manager.map(&mem, &fx.vm),
        Err(KfdMemError::HostFault(_))
    ));
    assert!(mem.mappings().is_empty());
    assert_eq!(fx.alloc.total_pins(), 0);

    fx.host.set_fail(false);
    let calls = fx.host.calls();
    fx.manager.map(&mem, &fx.vm).unwrap();
    assert_eq!(fx.host.calls(), calls + 1);
    assert!(fx.vm.is_mapped_in_hw(0x1000));
}

#[test]
fn failed_initial_fault_unwinds_allocation() {
    let fx = Fixture::new();
    fx.host.set_fail(true);

    let res = fx.manager.allocate(
        &fx.vm,
        0x1000,
        0x1000,
        MemDomain::HostPinned,
        AllocFlags::new(),
        Some(HOST),
    );
    assert!(matches!(res, Err(KfdMemError::HostFault(_))));
    assert_eq!(fx.alloc.live_of_kind(BoKind::Data), 0);
    assert_eq!(fx.manager.notifier().node_count(MM, MnKind::Hsa), 0);
    assert_eq!(fx.manager.usage().system, 0);
    assert!(fx.manager.process(MM).unwrap().mems().is_empty());
}

#[test]
fn userptr_needs_a_host_page_source() {
    let alloc = Arc::new(MockAllocator::default());
    let sched = Arc::new(MockScheduler::default());
    let device = KfdDevice::new(GPU_ID, alloc.clone(), sched);
    let manager = MemoryManager::new(test_config(), None);
    let vm = manager.acquire_vm(MM, &device).unwrap();

    let res = manager.allocate(
        &vm,
        0x1000,
        0x1000,
        MemDomain::HostPinned,
        AllocFlags::new(),
        Some(HOST),
    );
    assert!(matches!(res, Err(KfdMemError::HostFault(_))));
    assert_eq!(alloc.live_of_kind(BoKind::Data), 0);
}

#[test]
fn repeated_registrations_do_not_leak_nodes() {
    let fx = Fixture::new();
    let notifier = fx.manager.notifier();

    let mems: Vec<_> = (0..8)
        .map(|i| fx.alloc_userptr(0x10_0000 + i * 0x2000, 0x2000, HOST))
        .collect();
    assert_eq!(notifier.node_count(MM, MnKind::Hsa), 1);

    // A partially overlapping range extends the same node.
    let tail = fx.alloc_userptr(0x40_0000, 0x2000, HOST + 0x1000);
    assert_eq!(notifier.node_count(MM, MnKind::Hsa), 1);

    for mem in mems.iter().chain(std::iter::once(&tail)) {
        fx.manager.free(mem).unwrap();
    }
    assert_eq!(notifier.node_count(MM, MnKind::Hsa), 0);
}

#[test]
fn graphics_buffers_are_moved_out_on_invalidation() {
    let fx = Fixture::new();
    let bo = fx
        .alloc
        .create_bo(&BoCreateInfo {
            size: 0x1000,
            domain: BoDomain::Gtt,
            flags: 0,
            kind: BoKind::Data,
            userptr: Some(HOST),
        })
        .unwrap();

    let notifier = fx.manager.notifier();
    notifier
        .register_gfx(MM, bo, &fx.device, HOST, 0x1000)
        .unwrap();
    assert_eq!(notifier.node_count(MM, MnKind::Gfx), 1);

    let idle_waits = fx.alloc.wait_idle_calls();
    notifier.invalidate_range_start(MM, HOST, HOST + 0x1000);
    assert_eq!(fx.alloc.bo(bo).unwrap().domain, BoDomain::Cpu);
    assert_eq!(fx.alloc.wait_idle_calls(), idle_waits + 1);

    assert!(notifier.unregister_gfx(MM, bo));
    assert!(!notifier.unregister_gfx(MM, bo));
    assert_eq!(notifier.node_count(MM, MnKind::Gfx), 0);
}

#[test]
fn fault_gives_up_when_pages_keep_changing() {
    let fx = Fixture::new();
    let mem = fx.alloc_userptr(0x1000, 0x2000, HOST);
    fx.manager.map(&mem, &fx.vm).unwrap();

    // A restore that cannot fetch the pages leaves the mapping downgraded and the pages stale.
    let notifier = fx.manager.notifier().clone();
    notifier.invalidate_range_start(MM, HOST, HOST + 0x1000);
    fx.host.set_fail(true);
    notifier.invalidate_range_end(MM, HOST, HOST + 0x1000);
    flush_restore(&mem);
    fx.host.set_fail(false);
    assert_eq!(mem.eviction_count(), 0);
    assert!(mem.mappings()[0].map_failed);
    assert_eq!(fx.alloc.total_pins(), 0);

    // Every fetch races with another host-side change.
    fx.host
        .on_every_fault(move || notifier.invalidate_range_start(MM, HOST, HOST + 0x1000));
    let before = fx.host.calls();

    assert_eq!(
        fx.manager.map(&mem, &fx.vm),
        Err(KfdMemError::DeadlockAvoided)
    );
    fx.host.clear_every_fault();

    let retries = fx.manager.config().host_fault_retries;
    assert_eq!(fx.host.calls() - before, retries + 1);
    assert!(!mem.is_mapped_to(fx.vm.id));
    assert!(!fx.vm.is_mapped_in_hw(0x1000));
    assert_eq!(fx.alloc.pin_count(mem.bo), 0);
    assert_eq!(fx.alloc.pin_count(fx.vm.pd()), 0);
    assert_eq!(fx.alloc.total_pins(), 0);
}

#[test]
fn restore_of_freed_allocation_is_refused() {
    let fx = Fixture::new();
    let mem = fx.alloc_userptr(0x1000, 0x2000, HOST);
    evict_mem(&mem, MM).unwrap();
    fx.manager.free(&mem).unwrap();

    // Queueing fails, so the counter keeps the eviction outstanding.
    assert_eq!(
        schedule_restore_mem(&mem, MM, Duration::ZERO),
        Err(KfdMemError::ResourceExhausted)
    );
    assert_eq!(mem.eviction_count(), 2);
    assert!(!mem.restore_pending());
}

#[test]
fn host_range_at_address_space_end_is_refused() {
    let fx = Fixture::new();
    let res = fx.manager.allocate(
        &fx.vm,
        0x1000,
        0x2000,
        MemDomain::HostPinned,
        AllocFlags::new(),
        Some(u64::MAX - 0xfff),
    );
    assert!(matches!(res, Err(KfdMemError::InvalidArgument(_))));
    assert_eq!(fx.alloc.live_of_kind(BoKind::Data), 0);
    assert_eq!(fx.manager.usage().system, 0);
    assert_eq!(fx.manager.notifier().node_count(MM, MnKind::Hsa), 0);
}
