use ze_rs::runtime::driver;
use ze_rs::{DeviceConfig, DriverConfig, HwFamily};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("============================================================");
    println!("                 ze-rs - Device Information                 ");
    println!("============================================================");

    let driver = driver::acquire_with(|| {
        DriverConfig::empty()
            .with_device(DeviceConfig::new(HwFamily::Gen9))
            .with_device(DeviceConfig::new(HwFamily::Gen12Lp))
            .with_device(DeviceConfig::new(HwFamily::XeHpc).named("Data Center GPU"))
    })?;

    for device in driver.devices() {
        let props = device.properties();
        println!("\n[+] Device {}: {}", props.ordinal, props.name);
        println!("    Family:              {:?}", props.family);
        println!("    Local memory:        {} MiB", props.local_memory_size >> 20);
        println!("    Max allocation:      {} MiB", props.max_mem_alloc_size >> 20);
        println!("    Timer:               {} Hz", props.timer_resolution_hz);
        println!(
            "    Timestamp bits:      {}",
            props.kernel_timestamp_valid_bits
        );
        println!(
            "    Max group size:      {} ({:?} per dim)",
            props.max_group_size, props.max_group_size_per_dim
        );
        let pages: Vec<String> = props
            .page_sizes
            .iter()
            .map(|p| format!("{}K", p >> 10))
            .collect();
        println!("    Page sizes:          {}", pages.join(", "));

        for group in device.command_queue_groups() {
            println!(
                "    Queue group {}:       {:?} x{} (kernels: {}, fill pattern <= {} bytes)",
                group.ordinal,
                group.family,
                group.num_queues,
                group.supports_kernels,
                group.max_memory_fill_pattern_size
            );
        }

        let (host, gpu) = device.global_timestamps()?;
        println!("    Timestamps:          host {host} ns, device {gpu} ticks");
    }

    let context = driver.create_context()?;
    println!(
        "\n[+] Context over {} device(s), VA granularity {}K",
        context.devices().len(),
        context.granularity() >> 10
    );

    driver::release();
    Ok(())
}
