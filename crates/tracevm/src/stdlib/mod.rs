// The built-in library surface.

pub mod base;
pub mod kdebug;
pub mod os;
pub mod timer;

use crate::gc::AllocError;
use crate::vm::Global;

/// Register every built-in library; populates the C-function cache in
/// registration order.
pub fn open_all(g: &Global) -> Result<(), AllocError> {
    base::init(g)?;
    kdebug::init(g)?;
    timer::init(g)?;
    os::init(g)?;
    Ok(())
}
