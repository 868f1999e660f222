pub mod boxedarray;
pub mod num;
pub mod time;
