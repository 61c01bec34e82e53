//! x86_64 micro-kernels.

pub mod avx2;

pub use avx2::accumulate_pixel_avx2;
