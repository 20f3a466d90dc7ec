#![no_main]

use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use vm_core::{BlockFlags, GuestAddr, PageFlags, Vm, VmConfig};

const BASE: u32 = 0x0400_0000;
const SIZE: u32 = 0x0040_0000;

fn session() -> &'static Vm {
    static VM: OnceLock<Vm> = OnceLock::new();
    VM.get_or_init(|| Vm::new(VmConfig::compact()).expect("compact session"))
}

fuzz_target!(|data: &[u8]| {
    let vm = session();
    let block = vm
        .map(GuestAddr(BASE), SIZE, BlockFlags::empty())
        .expect("block range is free between runs");

    for chunk in data.chunks_exact(5) {
        let arg = u32::from_le_bytes([chunk[1], chunk[2], chunk[3], chunk[4]]);
        match chunk[0] % 5 {
            0 => {
                let align = 0x1000 << (chunk[1] % 8);
                if let Ok(addr) = block.alloc(arg % SIZE, align, None, None) {
                    assert!(vm.check_addr(addr, arg % SIZE, PageFlags::ALLOCATED));
                }
            }
            1 => {
                let addr = GuestAddr(BASE.wrapping_add(arg % SIZE) & !0xFFF);
                let _ = block.falloc(addr, u32::from(chunk[2]) * 0x1000, None, None);
            }
            2 => {
                let live = block.allocations();
                if !live.is_empty() {
                    let pick = live[arg as usize % live.len()];
                    let released = block.dealloc(pick.addr, None).expect("live allocation");
                    assert_eq!(released.size, pick.size);
                }
            }
            3 => {
                let addr = GuestAddr(BASE + (arg % SIZE) & !0xFFF);
                let flags = PageFlags::from_bits_truncate(chunk[2]) - PageFlags::ALLOCATED;
                let _ = vm.page_protect(addr, 0x1000, PageFlags::empty(), flags, PageFlags::empty());
            }
            _ => {
                let addr = GuestAddr(BASE + (arg % SIZE) & !0x7);
                if let Ok((value, reservation)) = vm.load_reserved_u64(addr) {
                    let _ = vm.store_conditional_u64(&reservation, value ^ u64::from(arg));
                }
            }
        }

        let live = block.allocations();
        for pair in live.windows(2) {
            assert!(u64::from(pair[0].addr.0) + u64::from(pair[0].size) <= u64::from(pair[1].addr.0));
        }
        assert_eq!(block.used(), live.iter().map(|a| a.size).sum::<u32>());
    }

    vm.unmap(GuestAddr(BASE), false).expect("unmap fuzz block");
});
