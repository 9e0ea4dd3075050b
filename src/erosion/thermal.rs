//! Talus-angle relaxation over 2x2 blocks.
//!
//! Each iteration runs four passes with the block grid shifted by one cell in x
//! and/or z. Blocks inside one pass never overlap, so rows of blocks are
//! processed in parallel without locking.

use rayon::prelude::*;

use crate::erosion::ErosionParameters;

/// Moves material between the pair when it is steeper than `max_diff`.
#[inline]
fn rectify(a: &mut f32, b: &mut f32, max_diff: f32, increment: f32) {
    let diff = *a - *b;
    let excess = diff.abs() - max_diff;
    if excess <= 0.0 {
        return;
    }
    let moved = increment * 0.5 * excess;
    if diff > 0.0 {
        *a -= moved;
        *b += moved;
    } else {
        *a += moved;
        *b -= moved;
    }
}

/// Largest pair difference a settled block may keep above `max_diff`.
const BLOCK_TOLERANCE: f32 = 1e-6;
/// Upper bound on sweeps over one block.
const MAX_BLOCK_SWEEPS: usize = 64;

/// Steepest pair of a block, minus `max_diff`.
#[inline]
fn block_excess(q: &[f32; 4], max_diff: f32) -> f32 {
    let lo = q.iter().copied().fold(f32::MAX, f32::min);
    let hi = q.iter().copied().fold(f32::MIN, f32::max);
    hi - lo - max_diff
}

/// Relaxes the six pairs of one block, `x y` on the top row and `z w` below,
/// sweeping until no pair is steeper than `max_diff`.
#[inline]
fn relax_block(q: &mut [f32; 4], max_diff: f32, increment: f32) {
    for _ in 0..MAX_BLOCK_SWEEPS {
        if block_excess(q, max_diff) <= BLOCK_TOLERANCE {
            return;
        }
        let [x, y, z, w] = q;
        rectify(x, y, max_diff, increment);
        rectify(x, z, max_diff, increment);
        rectify(x, w, max_diff, increment);
        rectify(y, z, max_diff, increment);
        rectify(y, w, max_diff, increment);
        rectify(z, w, max_diff, increment);
    }
}

/// One of the four shifted passes.
pub fn thermal_pass(heights: &mut [f32], resolution: usize, flip: u32, max_diff: f32, increment: f32) {
    let res = resolution;
    let first_row = if flip <= 1 { 2 } else { 1 };
    let first_col = if flip % 2 == 1 { 2 } else { 1 };
    let jobs = (res / 2).saturating_sub(1);
    if heights.len() <= first_row * res {
        return;
    }

    heights[first_row * res..]
        .par_chunks_mut(2 * res)
        .take(jobs)
        .for_each(|rows| {
            if rows.len() < 2 * res {
                return;
            }
            let (top, bottom) = rows.split_at_mut(res);
            let mut x = first_col;
            while x < res - 1 {
                let mut q = [top[x], top[x + 1], bottom[x], bottom[x + 1]];
                relax_block(&mut q, max_diff, increment);
                top[x] = q[0];
                top[x + 1] = q[1];
                bottom[x] = q[2];
                bottom[x + 1] = q[3];
                x += 2;
            }
        });
}

/// Runs `rounds` full four-pass iterations.
pub fn thermal_erosion(heights: &mut [f32], resolution: usize, max_diff: f32, increment: f32, rounds: u32) {
    for _ in 0..rounds {
        for flip in 0..4 {
            thermal_pass(heights, resolution, flip, max_diff, increment);
        }
    }
}

/// Thermal erosion with the tile's talus threshold.
pub fn apply_thermal(heights: &mut [f32], params: &ErosionParameters, rounds: u32) {
    thermal_erosion(
        heights,
        params.resolution,
        params.thermal_max_diff(),
        params.thermal_increment,
        rounds,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erosion::ErosionSettings;

    fn spike(res: usize, at: (usize, usize), value: f32) -> Vec<f32> {
        let mut h = vec![0.0; res * res];
        h[at.1 * res + at.0] = value;
        h
    }

    #[test]
    fn test_rectify_meets_threshold_with_full_increment() {
        let (mut a, mut b) = (1.0f32, 0.0f32);
        rectify(&mut a, &mut b, 0.2, 1.0);
        assert!((a - b - 0.2).abs() < 1e-6);
        assert!((a + b - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_pass_conserves_mass() {
        let res = 8;
        let mut h: Vec<f32> = (0..res * res).map(|i| ((i * 37) % 11) as f32 * 0.05).collect();
        let before: f32 = h.iter().sum();
        thermal_erosion(&mut h, res, 0.01, 0.6, 5);
        let after: f32 = h.iter().sum();
        assert!((before - after).abs() < 1e-4);
    }

    #[test]
    fn test_outer_row_and_column_zero_untouched() {
        let res = 6;
        let mut h: Vec<f32> = (0..res * res).map(|i| (i % 5) as f32 * 0.2).collect();
        let before = h.clone();
        thermal_erosion(&mut h, res, 0.01, 1.0, 3);
        for i in 0..res {
            assert_eq!(h[i], before[i]);
            assert_eq!(h[i * res], before[i * res]);
        }
    }

    #[test]
    fn test_relaxation_bounds_block_pairs() {
        let res = 6;
        let max_diff = 0.01;
        let mut h = spike(res, (3, 3), 1.0);
        thermal_erosion(&mut h, res, max_diff, 1.0, 2000);
        for z in 1..res {
            for x in 1..res {
                let here = h[z * res + x];
                for (dx, dz) in [(1i32, 0i32), (0, 1), (1, 1), (-1, 1)] {
                    let nx = x as i32 + dx;
                    let nz = z as i32 + dz;
                    if nx < 1 || nz < 1 || nx >= res as i32 || nz >= res as i32 {
                        continue;
                    }
                    let there = h[nz as usize * res + nx as usize];
                    assert!(
                        (here - there).abs() <= max_diff + 1e-3,
                        "({x},{z}) vs ({nx},{nz}): {}",
                        (here - there).abs()
                    );
                }
            }
        }
    }

    #[test]
    fn test_one_round_settles_every_block_of_the_last_pass() {
        let res = 64;
        let params = ErosionSettings::default().to_parameters(res).unwrap();
        let max_diff = params.thermal_max_diff();
        let mut h = spike(res, (31, 30), 1.0);
        for z in 0..res {
            for x in 40..res {
                h[z * res + x] += 0.6;
            }
        }
        assert!(0.6 > 2.0 * max_diff);

        apply_thermal(&mut h, &params, 1);
        // flip 3 blocks start at row 1, column 2
        for z in (1..res - 1).step_by(2) {
            for x in (2..res - 1).step_by(2) {
                let q = [
                    h[z * res + x],
                    h[z * res + x + 1],
                    h[(z + 1) * res + x],
                    h[(z + 1) * res + x + 1],
                ];
                assert!(
                    block_excess(&q, max_diff) <= 1e-5,
                    "block at ({x},{z}) still {} over",
                    block_excess(&q, max_diff)
                );
            }
        }
    }

    #[test]
    fn test_relax_block_converges_from_a_single_peak() {
        let mut q = [1.0, 0.0, 0.0, 0.0];
        relax_block(&mut q, 0.1, 0.6);
        assert!(block_excess(&q, 0.1) <= BLOCK_TOLERANCE);
        assert!((q.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_gentle_slopes_are_left_alone() {
        let params = ErosionSettings::default().to_parameters(16).unwrap();
        let max_diff = params.thermal_max_diff();
        let mut h: Vec<f32> = (0..256).map(|i| (i % 16) as f32 * max_diff * 0.5).collect();
        let before = h.clone();
        apply_thermal(&mut h, &params, 2);
        assert_eq!(h, before);
    }
}
