use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::paxos::error::{PaxosError, PaxosResult};

// Checked reader over an encoded buffer. All integers are big-endian and every
// variable-length field is prefixed by its length as a u32. Reading past the
// end yields a malformed error instead of panicking.
pub struct Reader {
    buf: Bytes,
}

impl Reader {
    pub fn new(buf: Bytes) -> Self {
        Reader { buf }
    }

    pub fn u8(&mut self, what: &str) -> PaxosResult<u8> {
        self.ensure(1, what)?;
        Ok(self.buf.get_u8())
    }

    pub fn u32(&mut self, what: &str) -> PaxosResult<u32> {
        self.ensure(4, what)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self, what: &str) -> PaxosResult<u64> {
        self.ensure(8, what)?;
        Ok(self.buf.get_u64())
    }

    // Reads a length-prefixed byte field without copying.
    pub fn bytes(&mut self, what: &str) -> PaxosResult<Bytes> {
        let len = self.u32(what)? as usize;
        self.ensure(len, what)?;
        Ok(self.buf.split_to(len))
    }

    // Reads a u32 element count, rejecting counts that could not possibly fit
    // in the remaining input given the minimum size of one element.
    pub fn count(&mut self, what: &str, min_element_bytes: usize) -> PaxosResult<usize> {
        let count = self.u32(what)? as usize;
        if count.saturating_mul(min_element_bytes) > self.buf.remaining() {
            return Err(PaxosError::Malformed(format!(
                "{} count {} exceeds remaining input",
                what, count
            )));
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    // Consumes the reader, failing if any input was left over.
    pub fn finish(self, what: &str) -> PaxosResult<()> {
        if self.buf.has_remaining() {
            return Err(PaxosError::Malformed(format!(
                "{} trailing bytes after {}",
                self.buf.remaining(),
                what
            )));
        }
        Ok(())
    }

    fn ensure(&self, len: usize, what: &str) -> PaxosResult<()> {
        if self.buf.remaining() < len {
            return Err(PaxosError::truncated(what));
        }
        Ok(())
    }
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}
