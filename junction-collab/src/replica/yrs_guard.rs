//! Structural check for untrusted yrs v1 updates.
//!
//! The yrs decoder trusts its input: strings are read without UTF-8
//! validation and some length prefixes go straight into allocations. Bytes
//! from the network are walked here first, and only the shapes a node
//! document produces are let through:
//!
//! - items whose parent is the named root map or is inherited from an origin
//! - item content that is either deleted or a run of string values
//! - GC and skip ranges
//! - a delete set whose ranges fit in `u32` clocks
//!
//! Everything else is rejected before yrs sees it.

use super::ReplicaError;

const GC: u8 = 0;
const SKIP: u8 = 10;
const CONTENT_DELETED: u8 = 1;
const CONTENT_ANY: u8 = 8;
const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;
const CONTENT_MASK: u8 = 0b0001_1111;
const ANY_STRING: u8 = 119;

/// Reject `bytes` unless it is a well-formed update for the `root` map.
pub(crate) fn check_update(bytes: &[u8], root: &str) -> Result<(), ReplicaError> {
    let mut reader = Reader { buf: bytes, pos: 0 };
    reader.update(root)?;
    if reader.remaining() != 0 {
        return Err(reader.fail("trailing bytes"));
    }
    Ok(())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn fail(&self, what: &str) -> ReplicaError {
        ReplicaError::Decode(format!("{what} at byte {}", self.pos))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, ReplicaError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| self.fail("unexpected end"))?;
        self.pos += 1;
        Ok(b)
    }

    fn var_u32(&mut self) -> Result<u32, ReplicaError> {
        let mut value: u64 = 0;
        for shift in (0..35).step_by(7) {
            let b = self.u8()?;
            value |= u64::from(b & 0x7F) << shift;
            if b & 0x80 == 0 {
                return u32::try_from(value).map_err(|_| self.fail("varint overflow"));
            }
        }
        Err(self.fail("varint too long"))
    }

    /// A count of items that each take at least one byte.
    fn count(&mut self) -> Result<u32, ReplicaError> {
        let n = self.var_u32()?;
        if n as usize > self.remaining() {
            return Err(self.fail("count exceeds input"));
        }
        Ok(n)
    }

    fn bytes(&mut self) -> Result<&'a [u8], ReplicaError> {
        let len = self.var_u32()? as usize;
        if len > self.remaining() {
            return Err(self.fail("length exceeds input"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn string(&mut self) -> Result<&'a str, ReplicaError> {
        let raw = self.bytes()?;
        std::str::from_utf8(raw).map_err(|_| self.fail("invalid utf-8"))
    }

    fn id(&mut self) -> Result<(), ReplicaError> {
        self.var_u32()?;
        self.var_u32()?;
        Ok(())
    }

    fn update(&mut self, root: &str) -> Result<(), ReplicaError> {
        let clients = self.count()?;
        for _ in 0..clients {
            let blocks = self.count()?;
            let _client = self.var_u32()?;
            let mut clock = self.var_u32()?;
            for _ in 0..blocks {
                let len = self.block(root)?;
                clock = clock
                    .checked_add(len)
                    .ok_or_else(|| self.fail("clock overflow"))?;
            }
        }
        self.delete_set()
    }

    /// Walk one block and return its clock length.
    fn block(&mut self, root: &str) -> Result<u32, ReplicaError> {
        let info = self.u8()?;
        if info == GC || info == SKIP {
            return self.positive_len();
        }

        let inherits_parent = info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) != 0;
        if info & HAS_ORIGIN != 0 {
            self.id()?;
        }
        if info & HAS_RIGHT_ORIGIN != 0 {
            self.id()?;
        }
        if !inherits_parent {
            if self.var_u32()? != 1 {
                return Err(self.fail("nested parent"));
            }
            if self.string()? != root {
                return Err(self.fail("unknown root"));
            }
            if info & HAS_PARENT_SUB == 0 {
                return Err(self.fail("root item without key"));
            }
            self.string()?;
        }

        match info & CONTENT_MASK {
            CONTENT_DELETED => self.positive_len(),
            CONTENT_ANY => {
                let values = self.count()?;
                if values == 0 {
                    return Err(self.fail("empty content"));
                }
                for _ in 0..values {
                    if self.u8()? != ANY_STRING {
                        return Err(self.fail("non-string value"));
                    }
                    self.string()?;
                }
                Ok(values)
            }
            _ => Err(self.fail("unsupported content")),
        }
    }

    fn positive_len(&mut self) -> Result<u32, ReplicaError> {
        match self.var_u32()? {
            0 => Err(self.fail("empty range")),
            len => Ok(len),
        }
    }

    fn delete_set(&mut self) -> Result<(), ReplicaError> {
        let clients = self.count()?;
        for _ in 0..clients {
            let _client = self.var_u32()?;
            let ranges = self.count()?;
            for _ in 0..ranges {
                let clock = self.var_u32()?;
                let len = self.var_u32()?;
                clock
                    .checked_add(len)
                    .ok_or_else(|| self.fail("delete range overflow"))?;
            }
        }
        Ok(())
    }
}
