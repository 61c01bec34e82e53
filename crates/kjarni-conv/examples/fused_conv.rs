//! Times fused convolution operators over a list of shape cases.
//!
//! Run with: cargo run --release --example fused_conv [cases.json] [iterations]
//!
//! Cases are a JSON array of shape descriptors, for example
//! `[{"bs":2,"ic":32,"ih":4,"iw":4,"oc":32,"oh":4,"ow":4,"kh":3,"kw":3,
//!    "ph":1,"pw":1,"sh":1,"sw":1,"oc1x1":32}]`.

use std::path::Path;
use std::time::{Duration, Instant};

use kjarni_conv::{Buffer, ConvBuilder, ConvParams, DType, Op, StageParams};

const DEFAULT_CASES: &str = r#"[
    {"bs": 2, "ic": 32, "ih": 4, "iw": 4, "oc": 32, "oh": 4, "ow": 4,
     "kh": 3, "kw": 3, "ph": 1, "pw": 1, "sh": 1, "sw": 1},
    {"bs": 2, "ic": 32, "ih": 4, "iw": 4, "oc": 32, "oh": 4, "ow": 4,
     "kh": 3, "kw": 3, "ph": 1, "pw": 1, "sh": 1, "sw": 1, "oc1x1": 32},
    {"bs": 1, "ic": 64, "ih": 56, "iw": 56, "oc": 64, "oh": 56, "ow": 56,
     "kh": 3, "kw": 3, "ph": 1, "pw": 1, "sh": 1, "sw": 1, "oc1x1": 128},
    {"bs": 1, "ic": 128, "ih": 28, "iw": 28, "oc": 128, "oh": 14, "ow": 14,
     "kh": 3, "kw": 3, "ph": 1, "pw": 1, "sh": 2, "sw": 2}
]"#;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let cases = match args.next() {
        Some(path) => ConvParams::from_json_file(Path::new(&path))?,
        None => ConvParams::from_json(DEFAULT_CASES)?,
    };
    let iterations: u32 = match args.next() {
        Some(n) => n.parse()?,
        None => 50,
    };

    for p in &cases {
        let src = Buffer::nhwc(p.src_dims(), DType::U8)?;
        src.fill_with(|i| (i * 7 % 16) as u8)?;
        let weights = Buffer::blocked_weights(p.weights_dims(), DType::S8)?;
        weights.fill_with(|i| (i * 13 % 9) as i8 - 4)?;
        let bias = Buffer::from_vec((0..p.oc as i32).map(|c| c - 16).collect::<Vec<_>>());
        let dst = Buffer::nhwc(p.dst_dims(), DType::U8)?;

        let mut builder = ConvBuilder::new(&src, &weights, &dst)
            .with_bias(&bias)
            .with_stride([p.sh, p.sw])
            .with_padding([p.ph, p.pw])
            .with_conv0(StageParams::new(vec![0.3]).with_relu(true));
        if p.is_fused() {
            let weights1x1 = Buffer::blocked_weights(p.weights1x1_dims(), DType::S8)?;
            weights1x1.fill_with(|i| (i * 5 % 7) as i8 - 3)?;
            builder = builder.with_conv1x1(&weights1x1, None, StageParams::new(vec![0.05]));
        }
        let mut op = builder.build()?;

        // Warmup
        op.execute();

        let mut times = Vec::with_capacity(iterations as usize);
        for _ in 0..iterations {
            let start = Instant::now();
            op.execute();
            times.push(start.elapsed());
        }

        let total: Duration = times.iter().sum();
        let min = times.iter().min().copied().unwrap_or_default();
        let max = times.iter().max().copied().unwrap_or_default();
        let nonzero = dst.to_vec::<u8>()?.iter().filter(|&&v| v != 0).count();

        println!(
            "{} src {:?} -> dst {:?} ({} bytes, {} non-zero)",
            op.name(),
            p.src_dims(),
            p.dst_dims(),
            dst.size_in_bytes(),
            nonzero
        );
        println!("  avg: {:?}", total / iterations.max(1));
        println!("  min: {:?}", min);
        println!("  max: {:?}", max);
    }
    Ok(())
}
