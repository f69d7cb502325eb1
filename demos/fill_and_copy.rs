use ze_rs::runtime::memory::virtual_mem::PhysicalMemoryDesc;
use ze_rs::runtime::memory::{DeviceMemAllocDesc, HostMemAllocDesc};
use ze_rs::{
    AccessAttribute, CommandList, CommandListDesc, CommandQueueBuilder, CommandQueueMode,
    DriverConfig, Driver, Event, EventDesc, EventPool, EventPoolDesc, EventPoolFlags,
    EventScopeFlags, FenceDesc, INFINITE_TIMEOUT,
};

const SIZE: u64 = 64 * 1024;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("============================================================");
    println!("                 ze-rs - Fill and Copy Test                 ");
    println!("============================================================");

    let driver = Driver::new(DriverConfig::default())?;
    let context = driver.create_context()?;
    let device = driver.devices()[0].clone();
    println!("[+] Using {}", device.properties().name);

    // 1. Explicit virtual memory: reserve, back, map.
    let reservation = context.reserve_virtual_memory(None, SIZE)?;
    let physical = context.create_physical_memory(&device, &PhysicalMemoryDesc { size: SIZE })?;
    context.map_virtual_memory(
        &reservation,
        0,
        SIZE,
        &physical,
        0,
        AccessAttribute::ReadWrite,
    )?;
    println!(
        "[+] Reserved and mapped 0x{:x}..0x{:x}",
        reservation.base,
        reservation.end()
    );

    // 2. USM allocations.
    let device_buf = context.mem_alloc_device(&DeviceMemAllocDesc::default(), SIZE, 0, &device)?;
    let host_buf = context.mem_alloc_host(&HostMemAllocDesc::default(), SIZE, 0)?;
    println!("[+] Device buffer at 0x{device_buf:x}, host buffer at 0x{host_buf:x}");

    // 3. A timestamped event around the copy-out.
    let pool = EventPool::create(
        &context,
        &EventPoolDesc {
            count: 1,
            flags: EventPoolFlags::HOST_VISIBLE | EventPoolFlags::KERNEL_TIMESTAMP,
        },
    )?;
    let done = Event::create(
        &pool,
        &EventDesc {
            index: 0,
            signal: EventScopeFlags::HOST,
            wait: EventScopeFlags::HOST,
        },
    )?;

    // 4. Record: fill device memory, bounce it through the reservation.
    let mut list = CommandList::create(&context, &device, &CommandListDesc::default())?;
    list.append_memory_fill(device_buf, &[0xC0, 0xFF, 0xEE, 0x00], SIZE, None, &[])?;
    list.append_barrier(None, &[])?;
    list.append_memory_copy(reservation.base, device_buf, SIZE, None, &[])?;
    list.append_barrier(None, &[])?;
    list.append_memory_copy(host_buf, reservation.base, SIZE, Some(&done), &[])?;
    list.close()?;
    println!(
        "[+] Recorded {} dwords touching {} block(s)",
        list.encoded_len(),
        list.referenced_memory_count()
    );

    // 5. Submit and wait on a fence.
    let queue = CommandQueueBuilder::new(&context, &device)
        .with_mode(CommandQueueMode::Asynchronous)
        .create()?;
    let fence = queue.create_fence(&FenceDesc::default());
    queue.execute_command_lists(&[&list], Some(&fence))?;
    fence.host_synchronize(INFINITE_TIMEOUT)?;

    let mut out = vec![0u8; SIZE as usize];
    context.read_memory(host_buf, &mut out)?;
    let ok = out.chunks_exact(4).all(|c| c == [0xC0, 0xFF, 0xEE, 0x00]);
    println!("[+] Host buffer verified: {}", if ok { "OK" } else { "MISMATCH" });

    let ts = done.query_kernel_timestamp()?;
    println!(
        "[+] Copy-out took {} ticks ({} Hz timer)",
        ts.duration(),
        device.properties().timer_resolution_hz
    );

    // 6. Tear down in reverse order.
    context.mem_free(host_buf)?;
    context.mem_free(device_buf)?;
    context.unmap_virtual_memory(reservation.base, SIZE)?;
    context.destroy_physical_memory(&physical)?;
    context.free_virtual_memory(reservation.base, SIZE)?;

    if ok { Ok(()) } else { Err("verification failed".into()) }
}
