//! CPU Radix Sort Implementation
//!
//! Host-side LSD radix sort using the same digit width as the device kernels
//! (4 bits, 16 buckets, 8 passes), so its output is the exact result the
//! engine must produce, including the order of tied keys' payloads.
//!
//! Complexity: O(n * k) where k = 8 (number of passes for 32-bit integers with 4-bit digits)

use crate::params::{digit, pass_shift, NUM_PASSES, SORT_BIN_COUNT};

const NUM_BUCKETS: usize = SORT_BIN_COUNT as usize;

/// Exclusive prefix sum of the digit histogram of `keys` at `shift`.
fn bucket_offsets(keys: &[u32], shift: u32) -> [usize; NUM_BUCKETS] {
    let mut histogram = [0usize; NUM_BUCKETS];
    for &key in keys {
        histogram[digit(key, shift)] += 1;
    }

    let mut sum = 0usize;
    for count in histogram.iter_mut() {
        let c = *count;
        *count = sum;
        sum += c;
    }
    histogram
}

/// Sort a slice in-place using LSD radix sort.
pub fn sort(data: &mut [u32]) {
    if data.len() <= 1 {
        return;
    }

    let mut temp = vec![0u32; data.len()];
    for pass in 0..NUM_PASSES {
        let shift = pass_shift(pass);
        let mut offsets = bucket_offsets(data, shift);

        for &value in data.iter() {
            let bucket = digit(value, shift);
            temp[offsets[bucket]] = value;
            offsets[bucket] += 1;
        }
        data.copy_from_slice(&temp);
    }
}

/// Stable sort of `keys` carrying `payload` along; returns both sorted.
///
/// Only the first `min(keys.len(), payload.len())` pairs are used.
pub fn sort_pairs(keys: &[u32], payload: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let n = keys.len().min(payload.len());
    let mut keys = keys[..n].to_vec();
    let mut payload = payload[..n].to_vec();
    if n <= 1 {
        return (keys, payload);
    }

    let mut temp_keys = vec![0u32; n];
    let mut temp_payload = vec![0u32; n];
    for pass in 0..NUM_PASSES {
        let shift = pass_shift(pass);
        let mut offsets = bucket_offsets(&keys, shift);

        for (&key, &value) in keys.iter().zip(&payload) {
            let bucket = digit(key, shift);
            temp_keys[offsets[bucket]] = key;
            temp_payload[offsets[bucket]] = value;
            offsets[bucket] += 1;
        }
        std::mem::swap(&mut keys, &mut temp_keys);
        std::mem::swap(&mut payload, &mut temp_payload);
    }
    (keys, payload)
}

/// Check if a slice is sorted in ascending order.
#[inline]
pub fn is_sorted(data: &[u32]) -> bool {
    data.windows(2).all(|w| w[0] <= w[1])
}
