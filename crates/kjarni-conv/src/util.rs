//! Small integer helpers shared by configuration and tiling.

/// Returns the first candidate that evenly divides `n`, or 1 if none does.
///
/// Candidates are tried in order, so list them by preference.
pub fn dividable_of(n: usize, candidates: &[usize]) -> usize {
    candidates
        .iter()
        .copied()
        .find(|&c| c > 0 && n % c == 0)
        .unwrap_or(1)
}

/// Returns the largest divisor of `n` that does not exceed `max`.
pub fn find_dividable(n: usize, max: usize) -> usize {
    if n <= max {
        return n.max(1);
    }
    (1..=max).rev().find(|&d| n % d == 0).unwrap_or(1)
}

/// Standard convolution output size along one axis.
///
/// `dilation` follows the zero-based convention: 0 means a dense kernel.
/// Returns `None` when the dilated kernel does not fit the padded input.
pub fn conv_output_size(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Option<usize> {
    if stride == 0 || kernel == 0 {
        return None;
    }
    let extent = (kernel - 1) * (dilation + 1) + 1;
    let padded = input + 2 * padding;
    if extent > padded {
        return None;
    }
    Some((padded - extent) / stride + 1)
}
