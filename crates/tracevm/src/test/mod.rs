mod util;

mod test_optimize;
mod test_strfmt;
mod test_table;
mod test_timer;
mod test_vm;
