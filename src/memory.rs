// The guest address space is a flat 64 KiB byte array. All address
// arithmetic wraps modulo 65536, which the u16 address type gives us for
// free; the helpers below exist so that word accesses wrap correctly at
// the top of memory as well.

pub const MEMORY_SIZE: usize = 64 * 1024;

/// Number of emulated BIOS entry points (the 17 CP/M 2.2 entries plus the
/// private delay entry).
pub const BIOS_VECTOR_COUNT: usize = 18;

/// Base of the magic addresses for OS calls: the last 19 addresses of the
/// guest address space. An instruction fetched from one of these addresses
/// transfers control to the emulated BDOS, to one of the emulated BIOS
/// entries, or to the host delay routine.
pub const MAGIC_ADDRESS: u16 = (MEMORY_SIZE - (1 + BIOS_VECTOR_COUNT)) as u16;

pub struct Memory {
    bytes: Box<[u8; MEMORY_SIZE]>,
}

impl Memory {
    pub fn new() -> Self {
        Memory { bytes: Box::new([0; MEMORY_SIZE]) }
    }

    pub fn get(&self, address: u16) -> u8 {
        self.bytes[address as usize]
    }

    pub fn set(&mut self, address: u16, value: u8) {
        self.bytes[address as usize] = value;
    }

    /// Little-endian word read; the high byte wraps around to 0x0000 when
    /// the word starts at 0xffff.
    pub fn get_word(&self, address: u16) -> u16 {
        let low = self.get(address) as u16;
        let high = self.get(address.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    pub fn set_word(&mut self, address: u16, word: u16) {
        self.set(address, (word & 0xff) as u8);
        self.set(address.wrapping_add(1), (word >> 8) as u8);
    }

    /// Contiguous view of memory; the caller guarantees that the range does
    /// not cross the end of the address space.
    pub fn slice(&self, address: u16, length: usize) -> &[u8] {
        &self.bytes[address as usize..address as usize + length]
    }

    pub fn slice_mut(&mut self, address: u16, length: usize) -> &mut [u8] {
        &mut self.bytes[address as usize..address as usize + length]
    }

    pub fn fill(&mut self, address: u16, length: usize, value: u8) {
        self.slice_mut(address, length).fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_access_wraps_at_top_of_memory() {
        let mut mem = Memory::new();
        mem.set_word(0xffff, 0xbeef);
        assert_eq!(mem.get(0xffff), 0xef);
        assert_eq!(mem.get(0x0000), 0xbe);
        assert_eq!(mem.get_word(0xffff), 0xbeef);
    }

    #[test]
    fn magic_range_is_nineteen_addresses() {
        assert_eq!(MAGIC_ADDRESS, 0xffed);
        assert_eq!(MEMORY_SIZE - MAGIC_ADDRESS as usize, 19);
    }
}
