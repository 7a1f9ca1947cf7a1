// Session arena for GC objects.
//
// Tables, protos, closures, upvalue cells, backtraces and aggregation
// tables are appended here and addressed by typed ids. Handing objects out
// as `Arc` keeps the pool lock out of table operations: allocation takes
// the lock briefly, everything after works on the object itself.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::gc::{BtraceId, ClosureId, PTableId, ProtoId, TableId, UpvalId};
use crate::limits::MAX_GC_OBJECTS;
use crate::ptable::PTable;
use crate::value::{Closure, Proto, Table, UpvalCell};

/// The session allocation ceiling was hit (or a size computation would
/// overflow). Reported to the script as a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

/// A captured stack trace. Hashed by a digest over its frames so equal
/// traces aggregate under one table key.
pub struct Backtrace {
    pub entries: Vec<u64>,
}

pub struct ObjectPool {
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    tables: Vec<Arc<Table>>,
    protos: Vec<Arc<Proto>>,
    closures: Vec<Arc<Closure>>,
    upvals: Vec<Arc<UpvalCell>>,
    btraces: Vec<Arc<Backtrace>>,
    ptables: Vec<Arc<PTable>>,
    count: usize,
}

impl PoolInner {
    fn charge(&mut self) -> Result<(), AllocError> {
        if self.count >= MAX_GC_OBJECTS {
            return Err(AllocError);
        }
        self.count += 1;
        Ok(())
    }
}

impl ObjectPool {
    pub fn new() -> Self {
        ObjectPool {
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn new_table(&self) -> Result<TableId, AllocError> {
        let mut p = self.inner.lock();
        p.charge()?;
        p.tables.push(Arc::new(Table::new()));
        Ok(TableId((p.tables.len() - 1) as u32))
    }

    pub fn new_proto(&self, proto: Proto) -> Result<ProtoId, AllocError> {
        let mut p = self.inner.lock();
        p.charge()?;
        p.protos.push(Arc::new(proto));
        Ok(ProtoId((p.protos.len() - 1) as u32))
    }

    pub fn new_closure(&self, closure: Closure) -> Result<ClosureId, AllocError> {
        let mut p = self.inner.lock();
        p.charge()?;
        p.closures.push(Arc::new(closure));
        Ok(ClosureId((p.closures.len() - 1) as u32))
    }

    pub fn new_upval(&self, cell: UpvalCell) -> Result<UpvalId, AllocError> {
        let mut p = self.inner.lock();
        p.charge()?;
        p.upvals.push(Arc::new(cell));
        Ok(UpvalId((p.upvals.len() - 1) as u32))
    }

    pub fn new_btrace(&self, bt: Backtrace) -> Result<BtraceId, AllocError> {
        let mut p = self.inner.lock();
        p.charge()?;
        p.btraces.push(Arc::new(bt));
        Ok(BtraceId((p.btraces.len() - 1) as u32))
    }

    pub fn new_ptable(&self, pt: PTable) -> Result<PTableId, AllocError> {
        let mut p = self.inner.lock();
        p.charge()?;
        p.ptables.push(Arc::new(pt));
        Ok(PTableId((p.ptables.len() - 1) as u32))
    }

    #[inline]
    pub fn table(&self, id: TableId) -> Arc<Table> {
        self.inner.lock().tables[id.index()].clone()
    }

    #[inline]
    pub fn proto(&self, id: ProtoId) -> Arc<Proto> {
        self.inner.lock().protos[id.index()].clone()
    }

    #[inline]
    pub fn closure(&self, id: ClosureId) -> Arc<Closure> {
        self.inner.lock().closures[id.index()].clone()
    }

    #[inline]
    pub fn upval(&self, id: UpvalId) -> Arc<UpvalCell> {
        self.inner.lock().upvals[id.index()].clone()
    }

    #[inline]
    pub fn btrace(&self, id: BtraceId) -> Arc<Backtrace> {
        self.inner.lock().btraces[id.index()].clone()
    }

    #[inline]
    pub fn ptable(&self, id: PTableId) -> Arc<PTable> {
        self.inner.lock().ptables[id.index()].clone()
    }

    /// Objects allocated so far (all kinds).
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
