//! CeruleanOS kernel entry.
//!
//! Bring-up order matters: per-CPU base and descriptor tables first,
//! then physical memory and the heap, then interrupt controllers and
//! devices, then filesystems, and finally the first process and the
//! scheduler loop.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod boot {
    use bootloader_api::config::{BootloaderConfig, Mapping};
    use bootloader_api::{entry_point, BootInfo};
    use bootloader_api::info::MemoryRegionKind;

    use cerulean_kernel::arch::x86_64::{acpi, apic, gdt, idt, percpu, syscall as arch_syscall};
    use cerulean_kernel::fs::{devfs, ext2, initfs, vfs};
    use cerulean_kernel::mm::{self, heap, paging, FRAME_ALLOCATOR};
    use cerulean_kernel::{block, drivers, logger, println, process, sched};

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        // The higher-half direct map backs all phys<->virt translation.
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    static INITFS_TYPE: initfs::InitFsType = initfs::InitFsType;
    static EXT2_TYPE: ext2::Ext2FsType = ext2::Ext2FsType;

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        percpu::init_bsp();
        logger::init();
        println!();
        println!("  ====  CeruleanOS  ====");

        gdt::init();
        percpu::reload_gs_base(); // segment reloads clear the GS base
        idt::init();

        // Physical memory: direct-map offset, then every usable region
        // into the buddy allocator.
        let hhdm = boot_info
            .physical_memory_offset
            .into_option()
            .expect("loader did not map physical memory");
        mm::set_hhdm_offset(hhdm);
        {
            use x86_64::registers::control::Cr3;
            paging::set_kernel_pml4(Cr3::read().0.start_address().as_u64());
        }

        let mut usable_bytes = 0u64;
        for region in boot_info.memory_regions.iter() {
            if region.kind == MemoryRegionKind::Usable {
                FRAME_ALLOCATOR.free_range(region.start, region.end);
                usable_bytes += region.end - region.start;
            }
        }
        FRAME_ALLOCATOR.enable_locking();
        log::info!(target: "mem", "{} MB available", usable_bytes / (1024 * 1024));

        heap::init().expect("kernel heap");

        arch_syscall::init();

        // Direct-map the non-usable regions (ACPI tables, MMIO holes)
        // and the RSDP page, then pull the MADT out.
        for region in boot_info.memory_regions.iter() {
            if region.kind != MemoryRegionKind::Usable {
                let _ = paging::map_mmio(region.start, region.end - region.start);
            }
        }
        let rsdp = boot_info.rsdp_addr.into_option();
        if let Some(rsdp) = rsdp {
            let _ = paging::map_mmio(rsdp, 4096);
            if let Err(e) = acpi::init(rsdp) {
                log::error!(target: "acpi", "no MADT: {}", e);
            }
        } else {
            log::error!(target: "acpi", "loader provided no RSDP");
        }

        apic::disable_pic();
        if let Err(e) = apic::init_lapic() {
            log::error!(target: "lapic", "init failed: {}", e);
        }
        if let Err(e) = apic::init_ioapic() {
            log::error!(target: "ioapic", "init failed: {}", e);
        }

        drivers::fb::init(boot_info.framebuffer.as_mut().into_option());

        // IRQ routing: timer, keyboard, mouse, both ATA channels.
        let bsp = apic::lapic_id();
        apic::route_irq(1, idt::VEC_KEYBOARD as u8, bsp);
        apic::route_irq(12, idt::VEC_MOUSE as u8, bsp);
        apic::route_irq(14, idt::VEC_ATA_PRIMARY as u8, bsp);
        apic::route_irq(15, idt::VEC_ATA_SECONDARY as u8, bsp);
        apic::pit_stop();
        apic::lapic_timer_periodic(idt::VEC_TIMER as u8, 1_000_000);
        log::info!(target: "irq", "routes configured");

        drivers::ps2::init();
        x86_64::instructions::interrupts::enable();

        drivers::pci::scan();
        drivers::ahci::init();
        drivers::ata::init();

        // Filesystems: initfs is the permanent root; ext2 overlays it
        // when a disk is present; devfs hangs at /dev either way.
        vfs().register_fs(&INITFS_TYPE).expect("initfs type");
        vfs().register_fs(&EXT2_TYPE).expect("ext2 type");
        devfs::init(vfs()).expect("devfs type");

        vfs().mount("initfs", None, "/", 0).expect("root mount");
        vfs().mkdir("/dev", 0o755).expect("mkdir /dev");

        let root_dev = block::get("ahci0").or_else(|| block::get("ata0"));
        match root_dev {
            Some(dev) => match vfs().mount("ext2", Some(dev), "/", 0) {
                Ok(()) => log::info!(target: "fs", "ext2 mounted at /"),
                Err(e) => log::error!(target: "fs", "ext2 mount failed ({})", e.code()),
            },
            None => log::info!(target: "fs", "no block device, running from initfs only"),
        }

        match vfs().mount("devfs", None, "/dev", 0) {
            Ok(()) => log::info!(target: "fs", "devfs mounted at /dev"),
            Err(e) => log::error!(target: "fs", "devfs mount failed ({})", e.code()),
        }

        match process::creation::create("/bin/init") {
            Ok(pid) => log::info!(target: "proc", "init started (pid {})", pid),
            Err(_) => log::error!(target: "proc", "no init found at /bin/init"),
        }

        println!();
        println!("  kernel ready");
        println!();
        sched::scheduler()
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        println!("[KERNEL PANIC] {}", info);
        cerulean_kernel::arch::x86_64::halt();
    }
}

#[cfg(not(target_os = "none"))]
fn main() {}
