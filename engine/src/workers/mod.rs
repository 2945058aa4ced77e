//! Background workers

pub mod proxy;
