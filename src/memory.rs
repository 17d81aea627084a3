//! Guest address space: `dosaddr_t`, `mem_base`, and region routing.
//!
//! Grounded on `boot/memory.rs` (the `vm_memory::GuestMemoryMmap` wrapper
//! pattern) and `original_source/src/include/memory.h`/`cpu.h`'s
//! `dosaddr_t`/`SEG_ADR`/`SEGOFF2LINEAR` macros. Unlike a single flat
//! guest-physical region, the DOS guest address space is routed through a
//! small table of regions (RAM, VGA window, ROM, MMIO) the way
//! `do_vm86.c`/`memory.c` dispatch `read_byte`/`write_byte`.

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// A guest linear address (dosemu2's `dosaddr_t`). 32-bit: the guest's
/// address space never exceeds 4GB in any of the four backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DosAddr(pub u32);

impl DosAddr {
    pub const fn new(addr: u32) -> Self {
        DosAddr(addr)
    }

    pub const fn offset(self, delta: u32) -> Self {
        DosAddr(self.0.wrapping_add(delta))
    }
}

/// Segment:offset far pointer, real-mode style (`far_t` in the original).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FarPtr {
    pub segment: u16,
    pub offset: u16,
}

impl FarPtr {
    pub const fn new(segment: u16, offset: u16) -> Self {
        Self { segment, offset }
    }

    /// `SEGOFF2LINEAR`: real-mode segment:offset to a 20-bit-wrapped linear
    /// address.
    pub const fn to_linear(self) -> DosAddr {
        DosAddr(((self.segment as u32) << 4).wrapping_add(self.offset as u32))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("address {0:#x} is out of bounds for this region")]
    OutOfBounds(u32),
    #[error("failed to allocate guest memory: {0}")]
    Allocation(String),
    #[error("address {0:#x} falls in an unmapped hole")]
    Unmapped(u32),
}

/// One entry of the region-routing table: a contiguous span of guest linear
/// address space and how reads/writes to it should be handled.
#[derive(Debug, Clone, Copy)]
enum RegionKind {
    /// Plain RAM, backed by the mmap'd `GuestMemoryMmap`.
    Ram,
    /// Video memory window (A0000-BFFFF): routed to the caller-supplied VGA
    /// hook rather than the flat RAM backing, per spec §4.11.
    Vga,
    /// Read-only ROM area (the BIOS/option-ROM range, including the HLT
    /// trampoline block carved out of it).
    Rom,
}

struct Region {
    start: u32,
    end: u32,
    kind: RegionKind,
}

/// Hook for VGA-window accesses, set by the embedder. Mirrors dosemu2's
/// `video_fd`/`remap.c` indirection: the core never hardcodes a video card
/// model.
pub trait VgaHandler {
    fn vga_read(&mut self, addr: DosAddr) -> u8;
    fn vga_write(&mut self, addr: DosAddr, value: u8);
}

/// The guest's flat address space plus the routing table layered over it.
pub struct AddressSpace {
    ram: GuestMemoryMmap,
    size: u32,
    regions: Vec<Region>,
}

const VGA_START: u32 = 0xa_0000;
const VGA_END: u32 = 0xc_0000;
const ROM_START: u32 = 0xc_0000;
const ROM_END: u32 = 0x10_0000;

impl AddressSpace {
    /// Allocate `size` bytes of guest RAM and install the default
    /// low-memory region table (RAM below 640K, VGA window, ROM area).
    pub fn new(size: u32) -> Result<Self, MemoryError> {
        let ranges = vec![(GuestAddress(0), size as usize)];
        let ram = GuestMemoryMmap::from_ranges(&ranges)
            .map_err(|e| MemoryError::Allocation(e.to_string()))?;

        let mut regions = vec![Region {
            start: 0,
            end: VGA_START.min(size),
            kind: RegionKind::Ram,
        }];
        if size > VGA_START {
            regions.push(Region {
                start: VGA_START,
                end: VGA_END.min(size),
                kind: RegionKind::Vga,
            });
        }
        if size > ROM_END {
            regions.push(Region {
                start: ROM_END,
                end: size,
                kind: RegionKind::Ram,
            });
        } else if size > ROM_START {
            regions.push(Region {
                start: ROM_START,
                end: size,
                kind: RegionKind::Rom,
            });
        }

        Ok(Self { ram, size, regions })
    }

    fn region_for(&self, addr: u32) -> Option<&Region> {
        self.regions
            .iter()
            .find(|r| addr >= r.start && addr < r.end)
    }

    pub fn read_byte(&self, addr: DosAddr, vga: &mut dyn VgaHandler) -> Result<u8, MemoryError> {
        match self.region_for(addr.0) {
            Some(Region { kind: RegionKind::Vga, .. }) => Ok(vga.vga_read(addr)),
            Some(_) => {
                let mut buf = [0u8; 1];
                self.ram
                    .read_slice(&mut buf, GuestAddress(addr.0 as u64))
                    .map_err(|_| MemoryError::OutOfBounds(addr.0))?;
                Ok(buf[0])
            }
            None => Err(MemoryError::Unmapped(addr.0)),
        }
    }

    pub fn write_byte(
        &self,
        addr: DosAddr,
        value: u8,
        vga: &mut dyn VgaHandler,
    ) -> Result<(), MemoryError> {
        match self.region_for(addr.0) {
            Some(Region { kind: RegionKind::Vga, .. }) => {
                vga.vga_write(addr, value);
                Ok(())
            }
            Some(Region { kind: RegionKind::Rom, .. }) => {
                // Writes to ROM are silently dropped, matching real hardware
                // and dosemu2's read-only BIOS area.
                Ok(())
            }
            Some(_) => self
                .ram
                .write_slice(&[value], GuestAddress(addr.0 as u64))
                .map_err(|_| MemoryError::OutOfBounds(addr.0)),
            None => Err(MemoryError::Unmapped(addr.0)),
        }
    }

    pub fn read_word(&self, addr: DosAddr, vga: &mut dyn VgaHandler) -> Result<u16, MemoryError> {
        let lo = self.read_byte(addr, vga)?;
        let hi = self.read_byte(addr.offset(1), vga)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn write_word(
        &self,
        addr: DosAddr,
        value: u16,
        vga: &mut dyn VgaHandler,
    ) -> Result<(), MemoryError> {
        let [lo, hi] = value.to_le_bytes();
        self.write_byte(addr, lo, vga)?;
        self.write_byte(addr.offset(1), hi, vga)
    }

    pub fn read_dword(&self, addr: DosAddr, vga: &mut dyn VgaHandler) -> Result<u32, MemoryError> {
        let lo = self.read_word(addr, vga)?;
        let hi = self.read_word(addr.offset(2), vga)?;
        Ok((hi as u32) << 16 | lo as u32)
    }

    pub fn write_dword(
        &self,
        addr: DosAddr,
        value: u32,
        vga: &mut dyn VgaHandler,
    ) -> Result<(), MemoryError> {
        self.write_word(addr, value as u16, vga)?;
        self.write_word(addr.offset(2), (value >> 16) as u16, vga)
    }

    pub fn read_qword(&self, addr: DosAddr, vga: &mut dyn VgaHandler) -> Result<u64, MemoryError> {
        let lo = self.read_dword(addr, vga)?;
        let hi = self.read_dword(addr.offset(4), vga)?;
        Ok((hi as u64) << 32 | lo as u64)
    }

    /// Direct RAM-only bulk copy, used by boot/loader setup and the JIT
    /// translation cache's guest-code reads. Bypasses VGA/ROM routing;
    /// callers are responsible for staying within the RAM region.
    pub fn write_slice(&self, addr: DosAddr, data: &[u8]) -> Result<(), MemoryError> {
        self.ram
            .write_slice(data, GuestAddress(addr.0 as u64))
            .map_err(|_| MemoryError::OutOfBounds(addr.0))
    }

    pub fn read_slice(&self, addr: DosAddr, data: &mut [u8]) -> Result<(), MemoryError> {
        self.ram
            .read_slice(data, GuestAddress(addr.0 as u64))
            .map_err(|_| MemoryError::OutOfBounds(addr.0))
    }

    /// Reads a whole file into guest RAM at `addr`, the way the original's
    /// loader stages a DOS image (COM/EXE, option ROM) into place before
    /// transferring control to it.
    pub fn load_image(&self, addr: DosAddr, path: &std::path::Path) -> Result<usize, MemoryError> {
        let bytes = std::fs::read(path).map_err(|e| MemoryError::Allocation(e.to_string()))?;
        self.write_slice(addr, &bytes)?;
        Ok(bytes.len())
    }

    /// Host virtual base address of the RAM mapping (`mem_base` in the
    /// original), used by the KVM backend to register the region and by the
    /// JIT backend when it needs a host pointer into guest code.
    pub fn mem_base(&self) -> u64 {
        self.ram.iter().next().expect("memory has no regions").as_ptr() as u64
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullVga;
    impl VgaHandler for NullVga {
        fn vga_read(&mut self, _addr: DosAddr) -> u8 {
            0xff
        }
        fn vga_write(&mut self, _addr: DosAddr, _value: u8) {}
    }

    #[test]
    fn far_ptr_wraps_like_real_mode() {
        let fp = FarPtr::new(0xffff, 0x0010);
        assert_eq!(fp.to_linear(), DosAddr(0xffff0 + 0x10));
    }

    #[test]
    fn ram_round_trip() {
        let mem = AddressSpace::new(1024 * 1024).unwrap();
        let mut vga = NullVga;
        mem.write_dword(DosAddr(0x1000), 0xdead_beef, &mut vga)
            .unwrap();
        assert_eq!(mem.read_dword(DosAddr(0x1000), &mut vga).unwrap(), 0xdead_beef);
    }

    #[test]
    fn vga_window_routes_to_handler() {
        struct Counting(u8);
        impl VgaHandler for Counting {
            fn vga_read(&mut self, _addr: DosAddr) -> u8 {
                self.0
            }
            fn vga_write(&mut self, _addr: DosAddr, value: u8) {
                self.0 = value;
            }
        }
        let mem = AddressSpace::new(1024 * 1024).unwrap();
        let mut vga = Counting(0);
        mem.write_byte(DosAddr(0xa_1234), 7, &mut vga).unwrap();
        assert_eq!(vga.0, 7);
        assert_eq!(mem.read_byte(DosAddr(0xa_1234), &mut vga).unwrap(), 7);
    }

    #[test]
    fn rom_writes_are_dropped() {
        let mem = AddressSpace::new(1024 * 1024).unwrap();
        let mut vga = NullVga;
        mem.write_byte(DosAddr(0xc_1000), 0x42, &mut vga).unwrap();
        assert_eq!(mem.read_byte(DosAddr(0xc_1000), &mut vga).unwrap(), 0);
    }

    #[test]
    fn load_image_stages_file_contents_into_ram() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x90, 0x90, 0xf4]).unwrap();
        let mem = AddressSpace::new(1024 * 1024).unwrap();
        let len = mem.load_image(DosAddr(0x2000), file.path()).unwrap();
        assert_eq!(len, 3);
        let mut buf = [0u8; 3];
        mem.read_slice(DosAddr(0x2000), &mut buf).unwrap();
        assert_eq!(buf, [0x90, 0x90, 0xf4]);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let mem = AddressSpace::new(4096).unwrap();
        let mut vga = NullVga;
        assert!(mem.read_byte(DosAddr(1_000_000), &mut vga).is_err());
    }
}
