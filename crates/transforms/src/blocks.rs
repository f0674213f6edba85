//! Non-overlapping 8x8 tiling.
//!
//! `[B, C, H, W]` becomes `[B, C, N, 64]` with `N = (H/8) * (W/8)` tiles in raster
//! order and each tile flattened row-major.

use burn::tensor::{backend::Backend, Tensor};

use crate::{TransformError, TransformResult};

pub const BLOCK_SIZE: usize = 8;
pub const COEFFS_PER_BLOCK: usize = BLOCK_SIZE * BLOCK_SIZE;

pub fn ensure_block_aligned(height: usize, width: usize) -> TransformResult<()> {
    if height == 0 || width == 0 || height % BLOCK_SIZE != 0 || width % BLOCK_SIZE != 0 {
        return Err(TransformError::NotBlockAligned {
            height,
            width,
            block: BLOCK_SIZE,
        });
    }
    Ok(())
}

/// Number of tiles per channel plane.
pub fn block_count(height: usize, width: usize) -> usize {
    (height / BLOCK_SIZE) * (width / BLOCK_SIZE)
}

pub fn blockify<B: Backend>(x: Tensor<B, 4>) -> TransformResult<Tensor<B, 4>> {
    let [batch, channels, height, width] = x.dims();
    ensure_block_aligned(height, width)?;
    let (rows, cols) = (height / BLOCK_SIZE, width / BLOCK_SIZE);
    Ok(x
        .reshape([batch, channels, rows, BLOCK_SIZE, cols, BLOCK_SIZE])
        .swap_dims(3, 4)
        .reshape([batch, channels, rows * cols, COEFFS_PER_BLOCK]))
}

pub fn deblockify<B: Backend>(
    blocks: Tensor<B, 4>,
    (height, width): (usize, usize),
) -> TransformResult<Tensor<B, 4>> {
    ensure_block_aligned(height, width)?;
    let [batch, channels, count, coeffs] = blocks.dims();
    let expected = block_count(height, width);
    if count != expected || coeffs != COEFFS_PER_BLOCK {
        return Err(TransformError::BlockCountMismatch {
            expected,
            actual: count,
            coeffs,
            height,
            width,
        });
    }
    let (rows, cols) = (height / BLOCK_SIZE, width / BLOCK_SIZE);
    Ok(blocks
        .reshape([batch, channels, rows, cols, BLOCK_SIZE, BLOCK_SIZE])
        .swap_dims(3, 4)
        .reshape([batch, channels, height, width]))
}

/// Pads bottom/right edges up to the next block multiple by replicating the last
/// row/column (what a baseline JPEG encoder does). Returns the original size so the
/// caller can crop back with [`crop`].
pub fn pad_to_block<B: Backend>(x: Tensor<B, 4>) -> (Tensor<B, 4>, (usize, usize)) {
    let [_, _, height, width] = x.dims();
    let pad_h = (BLOCK_SIZE - height % BLOCK_SIZE) % BLOCK_SIZE;
    let pad_w = (BLOCK_SIZE - width % BLOCK_SIZE) % BLOCK_SIZE;
    let mut out = x;
    if pad_h > 0 && height > 0 {
        let last = out.clone().narrow(2, height - 1, 1);
        let mut parts = vec![out];
        parts.extend((0..pad_h).map(|_| last.clone()));
        out = Tensor::cat(parts, 2);
    }
    if pad_w > 0 && width > 0 {
        let last = out.clone().narrow(3, width - 1, 1);
        let mut parts = vec![out];
        parts.extend((0..pad_w).map(|_| last.clone()));
        out = Tensor::cat(parts, 3);
    }
    (out, (height, width))
}

pub fn crop<B: Backend>(x: Tensor<B, 4>, (height, width): (usize, usize)) -> Tensor<B, 4> {
    let [_, _, h, w] = x.dims();
    if h == height && w == width {
        return x;
    }
    x.narrow(2, 0, height.min(h)).narrow(3, 0, width.min(w))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    #[test]
    fn deblockify_inverts_blockify() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random(
            [2, 3, 16, 24],
            Distribution::Uniform(-1.0, 1.0),
            &device,
        );
        let blocks = blockify(x.clone()).unwrap();
        assert_eq!(blocks.dims(), [2, 3, 6, 64]);
        let back = deblockify(blocks, (16, 24)).unwrap();
        assert_eq!(
            x.into_data().to_vec::<f32>().unwrap(),
            back.into_data().to_vec::<f32>().unwrap()
        );
    }

    #[test]
    fn tiles_are_raster_ordered_and_row_major() {
        let device = Default::default();
        let values: Vec<f32> = (0..16 * 16).map(|v| v as f32).collect();
        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(values, [1, 1, 16, 16]), &device);
        let blocks = blockify(x).unwrap().into_data().to_vec::<f32>().unwrap();
        // Second tile starts at column 8 of row 0; its second row starts at row 1.
        assert_eq!(blocks[64], 8.0);
        assert_eq!(blocks[64 + 8], 24.0);
        // Third tile is the first tile of the second tile-row.
        assert_eq!(blocks[128], 128.0);
    }

    #[test]
    fn misaligned_input_fails_fast() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 12, 16], &device);
        assert_eq!(
            blockify(x).unwrap_err(),
            TransformError::NotBlockAligned {
                height: 12,
                width: 16,
                block: 8
            }
        );
    }

    #[test]
    fn padding_replicates_edges_and_crops_back() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random(
            [1, 3, 10, 13],
            Distribution::Uniform(0.0, 1.0),
            &device,
        );
        let (padded, original) = pad_to_block(x.clone());
        assert_eq!(padded.dims(), [1, 3, 16, 16]);
        assert_eq!(original, (10, 13));

        let last_row = x.clone().narrow(2, 9, 1).into_data().to_vec::<f32>().unwrap();
        let padded_row = padded
            .clone()
            .narrow(2, 15, 1)
            .narrow(3, 0, 13)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_eq!(last_row, padded_row);

        let cropped = crop(padded, original);
        assert_eq!(
            cropped.into_data().to_vec::<f32>().unwrap(),
            x.into_data().to_vec::<f32>().unwrap()
        );
    }
}
