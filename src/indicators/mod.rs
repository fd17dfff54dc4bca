pub mod atr;

pub use atr::{true_ranges, wilders_atr, AtrPoint, DEFAULT_ATR_PERIOD};
