//! Detection pipeline -- collect, aggregate, score, report.

pub mod engine;

pub use engine::{run_detector_loop, CycleSummary, Detector, DetectorSettings};
