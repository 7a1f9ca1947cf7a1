// Parallel aggregation tables and the histogram renderer.
//
// A PTable owns one stats table per CPU plus a single aggregate. `set` is
// a CPU-local fold into the owning CPU's slot (no cross-CPU access at
// all); `get` merges every per-CPU accumulator for the key into the
// aggregate; `histogram` synthesizes all per-CPU tables and prints the
// top entries with a bar chart.

use crate::gc::{AllocError, PTableId, TableId};
use crate::limits::{HISTOGRAM_TOP_ENTRIES, PTABLE_HASH_SIZE};
use crate::value::{StatData, TableError, Value};
use crate::vm::{mem_error, runtime_error, table_err, Global, KResult, State};

pub struct PTable {
    /// One stats table per possible CPU.
    pub tbl: Vec<TableId>,
    pub agg: TableId,
}

fn new_stats_table(g: &Global, narr: usize, nrec: usize) -> Result<TableId, AllocError> {
    let id = g.objects.new_table()?;
    let sp = g.strings.lock();
    let tb = g.table(id);
    let mut data = tb.lock();
    data.with_stats = true;
    data.resize(&sp, narr, nrec).map_err(|_| AllocError)?;
    Ok(id)
}

pub fn ptable_new(g: &Global, narr: usize, nrec: usize) -> Result<PTableId, AllocError> {
    let nrec = if nrec == 0 { PTABLE_HASH_SIZE } else { nrec };
    let mut tbl = Vec::with_capacity(g.ncpus);
    for _ in 0..g.ncpus {
        tbl.push(new_stats_table(g, narr, nrec)?);
    }
    let agg = new_stats_table(g, narr, nrec)?;
    g.objects.new_ptable(PTable { tbl, agg })
}

/// CPU-local aggregation write: fold `val` into the calling CPU's slot.
pub fn ptable_set(
    g: &Global,
    ks: &mut State,
    pt: &PTable,
    key: &Value,
    val: &Value,
) -> KResult<()> {
    let Value::Number(n) = val else {
        return Err(runtime_error(
            g,
            ks,
            format_args!("add non number value to aggregation table"),
        ));
    };
    let tid = pt.tbl[ks.cpu.min(pt.tbl.len() - 1)];
    let r = {
        let sp = g.strings.lock();
        let tb = g.table(tid);
        let mut data = tb.lock();
        data.stat_add(&sp, key, *n)
    };
    r.map_err(|e| table_err(g, ks, e))
}

/// Merge every per-CPU accumulator for `key` into the aggregate and
/// return the folded statistics.
pub fn ptable_get(
    g: &Global,
    ks: &mut State,
    pt: &PTable,
    key: &Value,
) -> KResult<Option<StatData>> {
    let mut acc: Option<StatData> = None;
    for &tid in &pt.tbl {
        let sd = {
            let sp = g.strings.lock();
            let tb = g.table(tid);
            let data = tb.lock();
            data.stat_get(&sp, key)
        };
        if let Some(sd) = sd {
            match &mut acc {
                None => acc = Some(sd),
                Some(a) => a.merge(&sd),
            }
        }
    }
    if let Some(sd) = acc {
        let r = {
            let sp = g.strings.lock();
            let tb = g.table(pt.agg);
            let mut data = tb.lock();
            data.stat_put(&sp, key, sd)
        };
        r.map_err(|e| table_err(g, ks, e))?;
    }
    Ok(acc)
}

/// Rebuild the aggregate from all per-CPU tables.
pub fn ptable_synthesis(g: &Global, ks: &mut State, pt: &PTable) -> KResult<TableId> {
    g.table(pt.agg).lock().clear();
    for &tid in &pt.tbl {
        let entries = g.table(tid).lock().stat_entries();
        let r = {
            let sp = g.strings.lock();
            let tb = g.table(pt.agg);
            let mut data = tb.lock();
            let mut r: Result<StatData, TableError> = Ok(StatData::default());
            for (key, sd) in &entries {
                r = data.stat_merge(&sp, key, sd);
                if r.is_err() {
                    break;
                }
            }
            r
        };
        r.map_err(|e| table_err(g, ks, e))?;
    }
    Ok(pt.agg)
}

pub fn ptable_histogram(g: &Global, ks: &mut State, pt: &PTable) -> KResult<()> {
    let agg = ptable_synthesis(g, ks, pt)?;
    table_histogram(g, ks, agg)
}

// ---- histogram rendering --------------------------------------------

const DISTRIBUTION_WIDTH: usize = 40;
const DISTRIBUTION_STR: &str = "------------- Distribution -------------";

/// Keys longer than 32 columns are truncated with an ellipsis.
fn string_convert(input: &str) -> String {
    if input.len() > 32 {
        let mut s: String = input.chars().take(28).collect();
        s.push_str("...");
        s
    } else {
        input.to_string()
    }
}

/// key should be number or string, value number (or a stats slot, which
/// contributes its count).
pub fn table_histogram(g: &Global, ks: &mut State, tid: TableId) -> KResult<()> {
    let entries = g.table(tid).lock().entries();

    let mut rows: Vec<(Value, i64)> = Vec::with_capacity(entries.len());
    let mut total: i64 = 0;
    for (key, val) in entries {
        let num = match val {
            Value::Number(n) => n,
            Value::Stat(sd) => sd.count,
            _ => {
                return Err(runtime_error(
                    g,
                    ks,
                    format_args!(
                        "table histogram only handle (key: string/number val: number)"
                    ),
                ));
            }
        };
        rows.push((key, num));
        total += num;
    }
    rows.sort_by(|a, b| b.1.cmp(&a.1));

    let header = format!("{:>32}{}{}\n", "value ", DISTRIBUTION_STR, " count");
    g.transport.write(ks.cpu, header.as_bytes());
    if total == 0 {
        return Ok(());
    }

    // when the hottest key resolves to kernel text, symbolize all of them
    let is_kernel_address = matches!(
        rows.first(),
        Some((Value::Number(addr), _)) if g.backend.lookup_symbol(*addr as u64).is_some()
    );

    let top_num = rows.len().min(HISTOGRAM_TOP_ENTRIES);
    for (key, num) in rows.iter().take(top_num) {
        let ratio = ((num * DISTRIBUTION_WIDTH as i64) / total).clamp(0, DISTRIBUTION_WIDTH as i64)
            as usize;
        let mut dist = String::with_capacity(DISTRIBUTION_WIDTH);
        for i in 0..DISTRIBUTION_WIDTH {
            dist.push(if i < ratio { '@' } else { ' ' });
        }
        let keystr = match key {
            Value::Str(id) => string_convert(g.get_string(*id).as_str()),
            Value::Number(n) => {
                if is_kernel_address {
                    match g.backend.lookup_symbol(*n as u64) {
                        Some(sym) => string_convert(&sym),
                        None => {
                            let mut buf = itoa::Buffer::new();
                            buf.format(*n).to_string()
                        }
                    }
                } else {
                    let mut buf = itoa::Buffer::new();
                    buf.format(*n).to_string()
                }
            }
            other => other.type_name().to_string(),
        };
        let row = format!("{:>32} |{}{:<7}\n", keystr, dist, num);
        g.transport.write(ks.cpu, row.as_bytes());
    }

    if rows.len() > top_num {
        let row = format!("{:>32} |\n", "...");
        g.transport.write(ks.cpu, row.as_bytes());
    }
    Ok(())
}

/// Script-facing constructor (`ptable(narr, nrec)`).
pub fn ptable_value(g: &Global, ks: &mut State, narr: usize, nrec: usize) -> KResult<Value> {
    let id = ptable_new(g, narr, nrec).map_err(|_| mem_error(g, ks))?;
    Ok(Value::PTable(id))
}
