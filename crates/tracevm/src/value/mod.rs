// Values, tables, protos and the bytecode image.

pub mod image;
mod proto;
mod table;
mod value;

pub use proto::{LocVar, Proto, UpvalDesc};
pub use table::{Table, TableData, TableError};
pub use value::{Closure, StatData, Upval, UpvalCell, Value};
