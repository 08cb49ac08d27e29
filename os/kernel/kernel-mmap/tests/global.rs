use kernel_memory_addresses::PhysicalAddress;
use kernel_mmap::{MemoryKind, MemoryMap, MemoryMapError, MemoryRegion};

#[test]
fn installs_once() {
    assert!(kernel_mmap::get().is_none());

    let map = MemoryMap::new(&[
        MemoryRegion::new(PhysicalAddress::new(0x0), 0x9_F000, MemoryKind::Usable),
        MemoryRegion::new(PhysicalAddress::new(0xA_0000), 0x6_0000, MemoryKind::Reserved),
        MemoryRegion::new(PhysicalAddress::new(0x10_0000), 0x20_0000, MemoryKind::Kernel),
        MemoryRegion::new(PhysicalAddress::new(0x30_0000), 0x100_0000, MemoryKind::Usable),
    ])
    .unwrap();

    let installed = kernel_mmap::init(map.clone()).unwrap();
    assert_eq!(installed.len(), 4);
    assert!(std::ptr::eq(installed, kernel_mmap::get().unwrap()));

    let err = kernel_mmap::init(map).unwrap_err();
    assert_eq!(err, MemoryMapError::AlreadyInitialized);
    assert_eq!(kernel_mmap::get().unwrap().regions()[3].kind, MemoryKind::Usable);
}
