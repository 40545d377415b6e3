//! Print-process control for a bottom-up resin printer: the firmware link,
//! platform motion, projector power and the per-job print sequence.

pub mod config;
pub mod display;
pub mod hardware;
pub mod motion;
pub mod print;
pub mod print_job;
pub mod printer;
pub mod projector;
pub mod web;

pub use printer::{Printer, PrinterError};
