use super::error::EmuError;

pub const BANK_SIZE: usize = 0x0400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId(usize);

#[derive(Debug, Clone, Copy)]
struct Bank {
    buffer: usize,
    offset: usize,
}

#[derive(Debug, Clone)]
struct Buffer {
    data: Vec<u8>,
    writable: bool,
}

/// An address range split into 1 KiB banks, each pointing at a window of
/// one of the buffers owned by the space, or left unmapped (open bus).
#[derive(Debug, Clone)]
pub struct MemorySpace {
    name: &'static str,
    buffers: Vec<Buffer>,
    banks: Vec<Option<Bank>>,
}

impl MemorySpace {
    pub fn new(name: &'static str, size: usize) -> Self {
        Self {
            name,
            buffers: Vec::new(),
            banks: vec![None; size.div_ceil(BANK_SIZE)],
        }
    }

    pub fn size(&self) -> usize {
        self.banks.len() * BANK_SIZE
    }

    pub fn add_buffer(&mut self, data: Vec<u8>, writable: bool) -> BufferId {
        self.buffers.push(Buffer { data, writable });
        BufferId(self.buffers.len() - 1)
    }

    pub fn buffer(&self, id: BufferId) -> &[u8] {
        &self.buffers[id.0].data
    }

    pub fn buffer_mut(&mut self, id: BufferId) -> &mut [u8] {
        &mut self.buffers[id.0].data
    }

    pub fn buffer_len(&self, id: BufferId) -> usize {
        self.buffers[id.0].data.len()
    }

    pub fn map(
        &mut self,
        buffer: BufferId,
        target: usize,
        source_start: usize,
        source_end: usize,
    ) -> Result<(), EmuError> {
        let len = source_end.saturating_sub(source_start);
        self.check_window(target, len)?;
        if source_end <= source_start {
            return Err(self.mapping_error(target, len, "empty source range"));
        }
        let available = self
            .buffers
            .get(buffer.0)
            .map_or(0, |buffer| buffer.data.len());
        if source_end > available {
            return Err(self.mapping_error(target, len, "source range exceeds buffer"));
        }

        let first = target / BANK_SIZE;
        for (slot, bank) in self.banks[first..first + len / BANK_SIZE]
            .iter_mut()
            .enumerate()
        {
            *bank = Some(Bank {
                buffer: buffer.0,
                offset: source_start + slot * BANK_SIZE,
            });
        }
        Ok(())
    }

    pub fn unmap(&mut self, target: usize, len: usize) -> Result<(), EmuError> {
        self.check_window(target, len)?;
        let first = target / BANK_SIZE;
        self.banks[first..first + len / BANK_SIZE].fill(None);
        Ok(())
    }

    pub fn is_mapped(&self, addr: u16) -> bool {
        self.locate(addr).is_some()
    }

    pub fn read(&self, addr: u16, open_bus: u8) -> u8 {
        self.peek(addr).unwrap_or(open_bus)
    }

    pub fn peek(&self, addr: u16) -> Option<u8> {
        self.locate(addr)
            .map(|(buffer, index)| self.buffers[buffer].data[index])
    }

    pub fn write(&mut self, addr: u16, value: u8) {
        if let Some((buffer, index)) = self.locate(addr) {
            let buffer = &mut self.buffers[buffer];
            if buffer.writable {
                buffer.data[index] = value;
            }
        }
    }

    /// Debugger write: ignores the buffer's write protection.
    pub fn poke(&mut self, addr: u16, value: u8) {
        if let Some((buffer, index)) = self.locate(addr) {
            self.buffers[buffer].data[index] = value;
        }
    }

    fn locate(&self, addr: u16) -> Option<(usize, usize)> {
        let addr = addr as usize;
        let bank = (*self.banks.get(addr / BANK_SIZE)?)?;
        Some((bank.buffer, bank.offset + (addr % BANK_SIZE)))
    }

    fn check_window(&self, target: usize, len: usize) -> Result<(), EmuError> {
        if target % BANK_SIZE != 0 || len % BANK_SIZE != 0 {
            return Err(self.mapping_error(target, len, "not aligned to 1 KiB banks"));
        }
        if target + len > self.size() {
            return Err(self.mapping_error(target, len, "window exceeds address space"));
        }
        Ok(())
    }

    fn mapping_error(&self, target: usize, len: usize, reason: &'static str) -> EmuError {
        EmuError::Mapping {
            space: self.name,
            target,
            len,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space_with_rom(banks: usize) -> (MemorySpace, BufferId) {
        let mut space = MemorySpace::new("cpu", 0x10000);
        let data = (0..banks * BANK_SIZE).map(|i| (i / BANK_SIZE) as u8).collect();
        let id = space.add_buffer(data, false);
        (space, id)
    }

    #[test]
    fn unmapped_reads_return_open_bus() {
        let (space, _) = space_with_rom(4);
        assert_eq!(space.read(0x8000, 0x5A), 0x5A);
        assert!(!space.is_mapped(0x8000));
    }

    #[test]
    fn mapped_window_reads_through_to_source_offset() {
        let (mut space, rom) = space_with_rom(4);
        space.map(rom, 0x8000, 2 * BANK_SIZE, 4 * BANK_SIZE).unwrap();
        assert_eq!(space.read(0x8000, 0), 2);
        assert_eq!(space.read(0x87FF, 0), 3);
        assert_eq!(space.read(0x8800, 0xEE), 0xEE);
    }

    #[test]
    fn same_source_can_back_several_windows() {
        let (mut space, rom) = space_with_rom(1);
        space.map(rom, 0x2000, 0, BANK_SIZE).unwrap();
        space.map(rom, 0x2400, 0, BANK_SIZE).unwrap();
        assert_eq!(space.read(0x2000, 0xFF), space.read(0x2400, 0xFF));
    }

    #[test]
    fn writes_to_read_only_or_unmapped_banks_are_discarded() {
        let (mut space, rom) = space_with_rom(1);
        space.map(rom, 0x8000, 0, BANK_SIZE).unwrap();
        space.write(0x8000, 0x99);
        space.write(0x9000, 0x99);
        assert_eq!(space.read(0x8000, 0), 0);

        space.poke(0x8000, 0x99);
        assert_eq!(space.read(0x8000, 0), 0x99);
    }

    #[test]
    fn writable_buffer_accepts_writes() {
        let mut space = MemorySpace::new("cpu", 0x10000);
        let ram = space.add_buffer(vec![0; 0x2000], true);
        space.map(ram, 0x6000, 0, 0x2000).unwrap();
        space.write(0x7FFF, 0x42);
        assert_eq!(space.buffer(ram)[0x1FFF], 0x42);
    }

    #[test]
    fn misaligned_or_oversized_mappings_are_rejected() {
        let (mut space, rom) = space_with_rom(2);
        assert!(matches!(
            space.map(rom, 0x8100, 0, BANK_SIZE),
            Err(EmuError::Mapping { .. })
        ));
        assert!(space.map(rom, 0x8000, 0, 3 * BANK_SIZE).is_err());
        assert!(space.map(rom, 0xFC00, 0, 2 * BANK_SIZE).is_err());
        assert!(space.unmap(0x8000, 0x10).is_err());
    }
}
