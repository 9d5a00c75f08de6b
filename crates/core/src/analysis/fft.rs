//! In-place radix-2 Cooley-Tukey transform and the Hann window.

use std::f32::consts::PI;

use num_complex::Complex32;

use crate::{Result, SpectrumError};

/// Scales `samples` in place by a Hann window spanning the whole slice.
/// Slices of length 0 or 1 are left untouched.
pub fn apply_hann_window(samples: &mut [f32]) {
    let len = samples.len();
    if len <= 1 {
        return;
    }

    let denom = (len - 1) as f32;
    for (index, sample) in samples.iter_mut().enumerate() {
        *sample *= 0.5 * (1.0 - (2.0 * PI * index as f32 / denom).cos());
    }
}

/// Forward DFT computed in place. The result is not normalised.
///
/// Fails with [`SpectrumError::InvalidConfiguration`] when the length is not
/// a power of two. An empty buffer is a no-op.
pub fn fft_in_place(buffer: &mut [Complex32]) -> Result<()> {
    let n = buffer.len();
    if n == 0 {
        return Ok(());
    }
    if !n.is_power_of_two() {
        return Err(SpectrumError::invalid(format!(
            "fft length must be a power of two, got {n}"
        )));
    }

    radix2(buffer);
    Ok(())
}

/// Transform body for a buffer whose length is already known to be a power
/// of two.
pub(crate) fn radix2(buffer: &mut [Complex32]) {
    let n = buffer.len();
    bit_reverse_permute(buffer);

    let mut len = 2;
    while len <= n {
        let angle = -2.0 * PI / len as f32;
        let step = Complex32::new(angle.cos(), angle.sin());
        let half = len / 2;

        for chunk in buffer.chunks_exact_mut(len) {
            let mut twiddle = Complex32::new(1.0, 0.0);
            let (lower, upper) = chunk.split_at_mut(half);
            for (a, b) in lower.iter_mut().zip(upper.iter_mut()) {
                let u = *a;
                let v = *b * twiddle;
                *a = u + v;
                *b = u - v;
                twiddle *= step;
            }
        }

        len <<= 1;
    }
}

/// Inverse of [`fft_in_place`], including the `1/N` scaling.
pub fn ifft_in_place(buffer: &mut [Complex32]) -> Result<()> {
    for value in buffer.iter_mut() {
        *value = value.conj();
    }
    fft_in_place(buffer)?;

    let scale = 1.0 / buffer.len().max(1) as f32;
    for value in buffer.iter_mut() {
        *value = value.conj() * scale;
    }
    Ok(())
}

fn bit_reverse_permute(buffer: &mut [Complex32]) {
    let n = buffer.len();
    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            buffer.swap(i, j);
        }
    }
}
