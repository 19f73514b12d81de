#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod ceac;
pub mod export;
pub mod grid;
pub mod incremental;
pub mod nmb;
pub mod progress;
pub mod vbp;

#[path = "../data/mod.rs"]
pub mod data;

#[path = "../voi/mod.rs"]
pub mod voi;

#[cfg(test)]
pub(crate) mod test_fixtures;
