//! Convolution shape descriptors and the configuration builder.

pub mod conf;
pub mod params;

pub use conf::{Conv1x1Descs, ConvConf, ConvDescs, ConvWindow, ScaleMode, StageConf};
pub use params::{ConvParams, RoundMode, StageParams, StageShape};
