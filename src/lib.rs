#![warn(dead_code)]
#![warn(unused_imports)]

pub mod commands;
pub mod domains;
pub mod infrastructure;
pub mod shared;
