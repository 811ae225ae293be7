//! Row-major f32 kernels and their gradients.

pub fn matmul(a: &[f32], b: &[f32], n: usize, k: usize, m: usize) -> Vec<f32> {
    let mut out = vec![0.0; n * m];
    for i in 0..n {
        for p in 0..k {
            let av = a[i * k + p];
            for j in 0..m {
                out[i * m + j] += av * b[p * m + j];
            }
        }
    }
    out
}

/// `(dA, dB)` for `C = A·B` given `dC`.
pub fn matmul_grad(
    a: &[f32],
    b: &[f32],
    dc: &[f32],
    n: usize,
    k: usize,
    m: usize,
) -> (Vec<f32>, Vec<f32>) {
    let mut da = vec![0.0; n * k];
    let mut db = vec![0.0; k * m];
    for i in 0..n {
        for j in 0..m {
            let g = dc[i * m + j];
            for p in 0..k {
                da[i * k + p] += g * b[p * m + j];
                db[p * m + j] += a[i * k + p] * g;
            }
        }
    }
    (da, db)
}

/// Element-wise add, broadcasting `b` across rows when it is shorter.
pub fn add(a: &[f32], b: &[f32]) -> Vec<f32> {
    a.iter()
        .enumerate()
        .map(|(i, x)| x + b[i % b.len()])
        .collect()
}

/// Folds a gradient shaped like the broadcast result back onto `len` elements.
pub fn unbroadcast(grad: &[f32], len: usize) -> Vec<f32> {
    let mut out = vec![0.0; len];
    for (i, g) in grad.iter().enumerate() {
        out[i % len] += g;
    }
    out
}

pub fn relu(x: &[f32]) -> Vec<f32> {
    x.iter().map(|v| v.max(0.0)).collect()
}

pub fn relu_grad(x: &[f32], dy: &[f32]) -> Vec<f32> {
    x.iter()
        .zip(dy)
        .map(|(v, g)| if *v > 0.0 { *g } else { 0.0 })
        .collect()
}

pub fn scale(x: &[f32], factor: f32) -> Vec<f32> {
    x.iter().map(|v| v * factor).collect()
}

pub fn accumulate(dst: &mut Vec<f32>, src: &[f32]) {
    if dst.is_empty() {
        dst.extend_from_slice(src);
        return;
    }
    for (d, s) in dst.iter_mut().zip(src) {
        *d += s;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matmul_small() {
        // [1 2; 3 4] x [5; 6]
        assert_eq!(matmul(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0], 2, 2, 1), vec![17.0, 39.0]);
    }

    #[test]
    fn matmul_grad_matches_hand_derivation() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        // C = a (1x2) . b (2x1) = 11, dC = 1
        let (da, db) = matmul_grad(&a, &b, &[1.0], 1, 2, 1);
        assert_eq!(da, vec![3.0, 4.0]);
        assert_eq!(db, vec![1.0, 2.0]);
    }

    #[test]
    fn bias_broadcast_round_trip() {
        let y = add(&[1.0, 2.0, 3.0, 4.0], &[10.0, 20.0]);
        assert_eq!(y, vec![11.0, 22.0, 13.0, 24.0]);
        assert_eq!(unbroadcast(&[1.0, 1.0, 1.0, 1.0], 2), vec![2.0, 2.0]);
    }
}
