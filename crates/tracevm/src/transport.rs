// Per-CPU ring transport.
//
// Each CPU owns a subchannel, which is what makes concurrent writes
// correct without a global order: within one subchannel output is FIFO,
// across subchannels the consumer merges (by timestamp if it cares).
// A write that does not fit is dropped whole, never partially, matching
// relay semantics; drops are counted and logged.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::limits::TRANSPORT_SUBCHANNEL_SIZE;

struct SubChan {
    buf: Vec<u8>,
    /// Bytes below this offset were already drained.
    read: usize,
}

impl SubChan {
    fn pending(&self) -> usize {
        self.buf.len() - self.read
    }

    /// Drop consumed bytes so the buffer keeps its capacity bounded.
    fn compact(&mut self) {
        if self.read > 0 {
            self.buf.drain(..self.read);
            self.read = 0;
        }
    }
}

pub struct Transport {
    subs: Vec<spin::Mutex<SubChan>>,
    /// Session process id; the external layer keys output files by it.
    pid: i64,
    dropped: AtomicU64,
}

impl Transport {
    pub fn new(ncpus: usize, pid: i64) -> Transport {
        Transport {
            subs: (0..ncpus)
                .map(|_| {
                    spin::Mutex::new(SubChan {
                        buf: Vec::new(),
                        read: 0,
                    })
                })
                .collect(),
            pid,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn pid(&self) -> i64 {
        self.pid
    }

    /// Append bytes to a CPU's subchannel; drops the whole write when the
    /// subchannel is full.
    pub fn write(&self, cpu: usize, data: &[u8]) {
        let sub = &self.subs[cpu.min(self.subs.len() - 1)];
        let mut chan = sub.lock();
        if chan.pending() + data.len() > TRANSPORT_SUBCHANNEL_SIZE {
            drop(chan);
            self.dropped.fetch_add(data.len() as u64, Ordering::Relaxed);
            log::warn!("transport subchannel {} full, dropping {} bytes", cpu, data.len());
            return;
        }
        chan.compact();
        chan.buf.extend_from_slice(data);
    }

    /// Reserve `len` contiguous bytes in a CPU's subchannel. The caller
    /// fills the returned buffer; the bytes are committed when the
    /// reservation drops.
    pub fn reserve(&self, cpu: usize, len: usize) -> Option<Reservation<'_>> {
        let sub = &self.subs[cpu.min(self.subs.len() - 1)];
        let mut chan = sub.lock();
        if chan.pending() + len > TRANSPORT_SUBCHANNEL_SIZE {
            drop(chan);
            self.dropped.fetch_add(len as u64, Ordering::Relaxed);
            return None;
        }
        chan.compact();
        let start = chan.buf.len();
        chan.buf.resize(start + len, 0);
        Some(Reservation { chan, start })
    }

    /// Take everything pending on one subchannel, FIFO.
    pub fn drain(&self, cpu: usize) -> Vec<u8> {
        let mut chan = self.subs[cpu].lock();
        let out = chan.buf[chan.read..].to_vec();
        chan.read = chan.buf.len();
        chan.compact();
        out
    }

    /// Take everything pending, subchannels concatenated in CPU order.
    pub fn drain_all(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for cpu in 0..self.subs.len() {
            out.extend_from_slice(&self.drain(cpu));
        }
        out
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// An in-place write window into a subchannel.
pub struct Reservation<'a> {
    chan: spin::MutexGuard<'a, SubChan>,
    start: usize,
}

impl std::ops::Deref for Reservation<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.chan.buf[self.start..]
    }
}

impl std::ops::DerefMut for Reservation<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let start = self.start;
        &mut self.chan.buf[start..]
    }
}
