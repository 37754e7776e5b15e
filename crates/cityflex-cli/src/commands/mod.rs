pub mod output;
pub mod rolling;
pub mod schedule;
pub mod simulate;
pub mod validate;
