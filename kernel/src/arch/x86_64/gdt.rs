//! Global descriptor table and TSS.
//!
//! Layout:
//! - 0x00: null
//! - 0x08: kernel code (ring 0)
//! - 0x10: kernel data (ring 0)
//! - 0x18: TSS (two slots, 0x18-0x20)
//! - 0x28: user data (ring 3, selector 0x2B with RPL)
//! - 0x30: user code (ring 3, selector 0x33 with RPL)
//!
//! The user data/code order matches SYSRET expectations: SYSRET derives
//! SS = STAR[63:48]+8 and CS = STAR[63:48]+16.

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Boot-time ring 0 stack; the scheduler replaces rsp0 with each
        // process's kernel stack top on context switch.
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 4096 * 4;
            #[repr(align(16))]
            struct AlignedStack([u8; STACK_SIZE]);
            static mut BOOT_RSP0_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const BOOT_RSP0_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };

        // Dedicated double-fault stack.
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = {
            const STACK_SIZE: usize = 4096 * 4;
            #[repr(align(16))]
            struct AlignedStack([u8; STACK_SIZE]);
            static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const DOUBLE_FAULT_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment()); // 0x08
        let kernel_data = gdt.append(Descriptor::kernel_data_segment()); // 0x10
        let tss = gdt.append(Descriptor::tss_segment(&TSS)); // 0x18 (2 slots)
        let user_data = gdt.append(Descriptor::user_data_segment()); // 0x28
        let user_code = gdt.append(Descriptor::user_code_segment()); // 0x30
        (
            gdt,
            Selectors {
                kernel_code,
                kernel_data,
                tss,
                user_data,
                user_code,
            },
        )
    };
}

pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub tss: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
}

pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors were computed from the GDT just loaded, so
    // they reference valid descriptors. CS/DS/ES/SS must be reloaded to
    // pick up the new table; the TSS selector is loaded once.
    unsafe {
        CS::set_reg(GDT.1.kernel_code);
        DS::set_reg(GDT.1.kernel_data);
        ES::set_reg(GDT.1.kernel_data);
        SS::set_reg(GDT.1.kernel_data);
        load_tss(GDT.1.tss);
    }
}

/// Selectors for the syscall MSRs and for user-mode trap frames.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Update the ring 0 stack used for user→kernel transitions. Called by
/// the scheduler with interrupts disabled.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: the TSS is a pinned static; the scheduler serializes
    // writes by running with interrupts off on the only active CPU.
    unsafe {
        let tss = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}
