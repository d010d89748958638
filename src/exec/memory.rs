//! Flat byte-addressed memory for the interpreter and the simulated host.
//!
//! Addresses start at `BASE` so that 0 is never a valid address and null dereferences
//! are caught. Allocation is a bump pointer; nothing is ever returned to the heap, which
//! keeps freed object addresses unique for use-after-free detection.

use super::{ExecError, ExecResult};
use crate::ir::Ty;

pub const BASE: u64 = 0x1000;

#[derive(Debug, Clone, Default)]
pub struct Memory {
    bytes: Vec<u8>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes allocated so far.
    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    /// Allocate `size` zeroed bytes aligned to `align` (a power of two).
    pub fn alloc(&mut self, size: u64, align: u64) -> u64 {
        let align = align.max(1);
        let end = BASE + self.bytes.len() as u64;
        let start = (end + align - 1) & !(align - 1);
        let new_len = (start - BASE + size.max(1)) as usize;
        self.bytes.resize(new_len, 0);
        start
    }

    fn range(&self, addr: u64, size: u64) -> ExecResult<std::ops::Range<usize>> {
        if addr < BASE || addr.saturating_add(size) > BASE + self.bytes.len() as u64 {
            return Err(ExecError::BadAddress { addr, size });
        }
        let start = (addr - BASE) as usize;
        Ok(start..start + size as usize)
    }

    pub fn read_bytes(&self, addr: u64, size: u64) -> ExecResult<&[u8]> {
        let range = self.range(addr, size)?;
        Ok(&self.bytes[range])
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> ExecResult<()> {
        let range = self.range(addr, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Load a value of `ty`; `i32` is sign-extended, `i1` is masked to one bit.
    pub fn read(&self, addr: u64, ty: Ty) -> ExecResult<u64> {
        let bytes = self.read_bytes(addr, ty.size())?;
        Ok(match ty {
            Ty::I1 => (bytes[0] & 1) as u64,
            Ty::I32 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(bytes);
                i32::from_le_bytes(raw) as i64 as u64
            }
            Ty::I64 | Ty::Ptr => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                u64::from_le_bytes(raw)
            }
        })
    }

    pub fn write(&mut self, addr: u64, ty: Ty, value: u64) -> ExecResult<()> {
        match ty {
            Ty::I1 => self.write_bytes(addr, &[(value & 1) as u8]),
            Ty::I32 => self.write_bytes(addr, &(value as u32).to_le_bytes()),
            Ty::I64 | Ty::Ptr => self.write_bytes(addr, &value.to_le_bytes()),
        }
    }

    pub fn read_u64(&self, addr: u64) -> ExecResult<u64> {
        self.read(addr, Ty::I64)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> ExecResult<()> {
        self.write(addr, Ty::I64, value)
    }

    pub fn read_i64(&self, addr: u64) -> ExecResult<i64> {
        Ok(self.read(addr, Ty::I64)? as i64)
    }

    /// Copy `s` plus a NUL terminator into fresh memory.
    pub fn alloc_cstr(&mut self, s: &str) -> u64 {
        let addr = self.alloc(s.len() as u64 + 1, 1);
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        // The range was just allocated.
        let _ = self.write_bytes(addr, &data);
        addr
    }

    pub fn read_cstr(&self, addr: u64) -> ExecResult<String> {
        let mut out = Vec::new();
        let mut cursor = addr;
        loop {
            let byte = self.read_bytes(cursor, 1)?[0];
            if byte == 0 {
                break;
            }
            out.push(byte);
            cursor += 1;
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_alignment_and_null() {
        let mut mem = Memory::new();
        let a = mem.alloc(3, 1);
        let b = mem.alloc(8, 8);
        assert_eq!(a, BASE);
        assert_eq!(b % 8, 0);
        assert!(b >= a + 3);
        assert!(matches!(mem.read(0, Ty::Ptr), Err(ExecError::BadAddress { addr: 0, .. })));
    }

    #[test]
    fn test_i32_sign_extension() {
        let mut mem = Memory::new();
        let slot = mem.alloc(8, 8);
        mem.write(slot, Ty::I32, (-5i64) as u64).unwrap();
        assert_eq!(mem.read(slot, Ty::I32).unwrap() as i64, -5);
    }

    #[test]
    fn test_cstr_roundtrip() {
        let mut mem = Memory::new();
        let s = mem.alloc_cstr("frob");
        assert_eq!(mem.read_cstr(s).unwrap(), "frob");
    }
}
