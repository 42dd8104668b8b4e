//! CRC-64/XZ section checksum
//!
//! Reflected polynomial 0xC96C5795D7870F42, initial value and final xor all
//! ones. The table is built at compile time.

const POLY: u64 = 0xC96C_5795_D787_0F42;

const TABLE: [u64; 256] = build_table();

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Incremental CRC-64 over several discontiguous slices
#[derive(Debug, Clone, Copy)]
pub struct Crc64 {
    state: u64,
}

impl Default for Crc64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc64 {
    pub const fn new() -> Self {
        Self { state: !0 }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        let mut crc = self.state;
        for &b in bytes {
            crc = TABLE[((crc ^ b as u64) & 0xff) as usize] ^ (crc >> 8);
        }
        self.state = crc;
    }

    pub fn finish(&self) -> u64 {
        self.state ^ !0
    }
}

/// One-shot CRC-64 of a byte slice
pub fn crc64(bytes: &[u8]) -> u64 {
    let mut crc = Crc64::new();
    crc.update(bytes);
    crc.finish()
}

/// Checksum stored in the header: CRC-64 over code, data and the encoded export table
pub fn section_checksum(code: &[u8], data: &[u8], export_table: &[u8]) -> u64 {
    let mut crc = Crc64::new();
    crc.update(code);
    crc.update(data);
    crc.update(export_table);
    crc.finish()
}
