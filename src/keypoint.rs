//! The keypoint codec: the pixel-packed wire format that carries a
//! variable-length list of feature points through a fixed-size GPU texture.
//! Shader kernels can only write to a fixed-size texture, so a detector's
//! sparse, variable-length output must be packed into a dense rectangular
//! layout and later decoded back into a list on the host.
//!
//! Both directions are provided as pure functions over byte slices so they
//! run without a GPU and so a fragment-kernel implementation has an
//! executable contract to match.

use std::collections::HashMap;
use std::f32::consts::PI;

use crate::value::{Keypoint, Point};

/// Two pixels: position (pixel 0) and lod/orientation/score (pixel 1).
pub const MIN_KEYPOINT_SIZE: usize = 8;

/// Default sub-pixel fixed-point denominator: 8 fractional bits. Callers with
/// larger images should pick a coarser resolution via
/// [`fix_resolution_for`] so that `max_dimension * resolution` still fits
/// the 16-bit position field (reserving `0xFFFF` for the sentinel).
pub const FIX_RESOLUTION: u32 = 1 << 8;

/// Reference scale range for [`encode_lod`]/[`decode_lod`]: `2^-4 .. 2^(4+8)`.
pub const LOG2_PYRAMID_MAX_SCALE: f32 = 4.0;
pub const PYRAMID_MAX_LEVELS: f32 = 8.0;

/// Number of keypoint cells grouped into one encoder dispatch tile (Open
/// Question b). A power of two so `KeypointLayout::for_capacity` can always
/// satisfy the `encoderLength` divisibility requirement by rounding the
/// requested capacity up to a multiple of this.
pub const TILE_KEYPOINTS: usize = 64;

const SENTINEL_RAW: u16 = 0xFFFF;

/// Choose the largest power-of-two fixed-point resolution such that
/// `max_dimension * resolution` still fits in 16 bits, reserving `0xFFFF`
/// for the end-of-list sentinel.
pub fn fix_resolution_for(max_dimension: u32) -> u32 {
    let mut resolution = FIX_RESOLUTION;
    while resolution > 1 && max_dimension.max(1) * resolution > 0xFFFE {
        resolution /= 2;
    }
    resolution
}

/// Describes how a fixed-size square texture is partitioned into one cell
/// per keypoint under the dense packed encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeypointLayout {
    pub descriptor_size: usize,
    pub extra_size: usize,
    /// Width/height in pixels of the square texture (the "encoder length").
    pub encoder_length: u32,
}

impl KeypointLayout {
    /// Number of pixels occupied by one keypoint cell.
    pub fn cell_pixels(&self) -> usize {
        cell_pixels_for(self.descriptor_size, self.extra_size)
    }

    pub fn cell_bytes(&self) -> usize {
        self.cell_pixels() * 4
    }

    /// Maximum number of keypoints this layout's texture can hold.
    pub fn capacity(&self) -> usize {
        let total_pixels = (self.encoder_length as usize) * (self.encoder_length as usize);
        total_pixels / self.cell_pixels()
    }

    /// Build a layout sized to hold at least `capacity` keypoints, rounding
    /// up to a whole number of [`TILE_KEYPOINTS`]-sized tiles and to the
    /// smallest square texture that fits them.
    pub fn for_capacity(capacity: usize, descriptor_size: usize, extra_size: usize) -> Self {
        let cell_pixels = cell_pixels_for(descriptor_size, extra_size);
        let cells = round_up(capacity.max(1), TILE_KEYPOINTS);
        let total_pixels = cells * cell_pixels;
        let mut side = (total_pixels as f64).sqrt().ceil() as u32;
        while (side as usize) * (side as usize) < total_pixels {
            side += 1;
        }
        KeypointLayout {
            descriptor_size,
            extra_size,
            encoder_length: side.max(1),
        }
    }
}

fn cell_pixels_for(descriptor_size: usize, extra_size: usize) -> usize {
    let bytes = MIN_KEYPOINT_SIZE + descriptor_size + extra_size;
    (bytes + 3) / 4
}

fn round_up(value: usize, multiple: usize) -> usize {
    let remainder = value % multiple;
    if remainder == 0 {
        value
    } else {
        value + (multiple - remainder)
    }
}

/// One detected feature point as produced by a detector/descriptor/refiner
/// chain, ready to be packed into the dense wire format. `x`/`y` are raster
/// positions in the *source* image; `corner_score` is the raw detector
/// response used by the sparse raw encoding (0 means "not a keypoint").
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateKeypoint {
    pub x: u32,
    pub y: u32,
    pub corner_score: u8,
    pub intensity: u8,
    pub scale_byte: u8,
    pub lod: f32,
    pub orientation: f32,
    pub score: u16,
    pub descriptor: Vec<u8>,
    pub extra: Vec<u8>,
}

impl CandidateKeypoint {
    pub fn raster_index(&self, width: u32) -> u64 {
        u64::from(self.y) * u64::from(width) + u64::from(self.x)
    }
}

/// The sparse, per-pixel detector output: one texture with `R` = corner
/// score, `G` = intensity, `B` = skip-offset hint, `A` = scale.
pub struct SparseRaster {
    width: u32,
    height: u32,
    /// `(r, g, skip, a)` per pixel, row-major.
    pixels: Vec<(u8, u8, u8, u8)>,
}

impl SparseRaster {
    /// Build the sparse raster for a set of candidates, computing each
    /// non-keypoint pixel's skip-offset hint by a single backward pass: the
    /// hint at pixel `p` is `min(254, distance to the next keypoint - 1)`.
    pub fn build(width: u32, height: u32, candidates: &[CandidateKeypoint]) -> Self {
        let total = (width as usize) * (height as usize);
        let mut pixels = vec![(0u8, 0u8, 0u8, 0u8); total];

        for c in candidates {
            debug_assert!(c.x < width && c.y < height);
            let idx = c.raster_index(width) as usize;
            pixels[idx] = (c.corner_score, c.intensity, 0, c.scale_byte);
        }

        let mut next_keypoint: Option<usize> = None;
        for idx in (0..total).rev() {
            if pixels[idx].0 != 0 {
                next_keypoint = Some(idx);
            } else {
                let skip = match next_keypoint {
                    Some(next) => (next - idx - 1).min(254) as u8,
                    None => 254,
                };
                pixels[idx].2 = skip;
            }
        }

        SparseRaster {
            width,
            height,
            pixels,
        }
    }

    /// Walk the raster counting keypoints (non-zero `R`) until the `q`-th
    /// one is found, leaping over runs of non-keypoint pixels using each
    /// pixel's skip-offset hint rather than visiting every pixel. This is
    /// the host-side model of the GPU encoder kernel's per-thread scan.
    pub fn scan_nth_keypoint(&self, q: usize) -> Option<(u32, u32)> {
        let total = self.pixels.len();
        let mut idx = 0usize;
        let mut found = 0usize;

        while idx < total {
            let (r, _, skip, _) = self.pixels[idx];
            if r != 0 {
                if found == q {
                    let x = (idx % self.width as usize) as u32;
                    let y = (idx / self.width as usize) as u32;
                    return Some((x, y));
                }
                found += 1;
                idx += 1;
            } else {
                idx += 1 + skip as usize;
            }
        }

        None
    }
}

/// Encode `candidates` into the dense packed wire format, simulating the
/// GPU encoder kernel's per-cell "find the q-th keypoint" scan on the host.
/// Cells beyond the number of available keypoints are filled with the
/// null-keypoint sentinel.
pub fn encode_sparse_to_dense(
    candidates: &[CandidateKeypoint],
    width: u32,
    height: u32,
    layout: &KeypointLayout,
    fix_resolution: u32,
) -> Vec<u8> {
    let raster = SparseRaster::build(width, height, candidates);
    let by_position: HashMap<(u32, u32), &CandidateKeypoint> =
        candidates.iter().map(|c| ((c.x, c.y), c)).collect();

    let cell_bytes = layout.cell_bytes();
    let mut out = vec![0u8; cell_bytes * layout.capacity()];

    for q in 0..layout.capacity() {
        let cell = &mut out[q * cell_bytes..(q + 1) * cell_bytes];
        match raster
            .scan_nth_keypoint(q)
            .and_then(|pos| by_position.get(&pos).copied())
        {
            Some(candidate) => write_cell(cell, candidate, layout, fix_resolution),
            None => write_null_cell(cell),
        }
    }

    out
}

/// Encode an already-decoded, finite list of keypoints directly into the
/// dense packed wire format, one cell per keypoint in list order, followed
/// by null-sentinel cells filling out the rest of the layout's capacity.
///
/// Unlike [`encode_sparse_to_dense`], this never builds a [`SparseRaster`]:
/// the caller already holds a concrete ordered `Vec<Keypoint>` (a clipper's
/// score-sorted result, a mixer's merged list, a transformer's output), so
/// there is no "find the q-th keypoint" scan to simulate, and no need to
/// round sub-pixel positions down to a raster cell first. Used by every
/// engine node that re-publishes a keypoint list it has already decoded
/// rather than one it detected directly off a sparse raster.
///
/// `keypoints.len()` must not exceed `layout.capacity()`; excess keypoints
/// are silently dropped (callers are expected to size `layout` to fit, as
/// `Keypoint.Clipper` does by truncating before computing its output
/// layout).
pub fn encode_keypoints_dense(keypoints: &[Keypoint], layout: &KeypointLayout, fix_resolution: u32) -> Vec<u8> {
    let cell_bytes = layout.cell_bytes();
    let capacity = layout.capacity();
    let mut out = vec![0u8; cell_bytes * capacity];

    for (q, keypoint) in keypoints.iter().take(capacity).enumerate() {
        let cell = &mut out[q * cell_bytes..(q + 1) * cell_bytes];
        write_keypoint_cell(cell, keypoint, layout, fix_resolution);
    }
    for q in keypoints.len().min(capacity)..capacity {
        let cell = &mut out[q * cell_bytes..(q + 1) * cell_bytes];
        write_null_cell(cell);
    }

    out
}

fn write_keypoint_cell(cell: &mut [u8], keypoint: &Keypoint, layout: &KeypointLayout, fix_resolution: u32) {
    let x_raw = fixed_point_encode(keypoint.position.x, fix_resolution);
    let y_raw = fixed_point_encode(keypoint.position.y, fix_resolution);

    cell[0] = (x_raw & 0xFF) as u8;
    cell[1] = (x_raw >> 8) as u8;
    cell[2] = (y_raw & 0xFF) as u8;
    cell[3] = (y_raw >> 8) as u8;

    cell[4] = encode_lod(keypoint.lod);
    cell[5] = encode_orientation(keypoint.orientation);
    cell[6] = (keypoint.score & 0xFF) as u8;
    cell[7] = (keypoint.score >> 8) as u8;

    let descriptor_extra = &mut cell[8..];
    for byte in descriptor_extra.iter_mut() {
        *byte = 0;
    }
    descriptor_extra[..layout.descriptor_size].copy_from_slice(&keypoint.descriptor[..layout.descriptor_size]);
    descriptor_extra[layout.descriptor_size..layout.descriptor_size + layout.extra_size]
        .copy_from_slice(&keypoint.extra[..layout.extra_size]);
}

fn write_null_cell(cell: &mut [u8]) {
    cell[0] = 0xFF;
    cell[1] = 0xFF;
    cell[2] = 0xFF;
    cell[3] = 0xFF;
    for byte in &mut cell[4..] {
        *byte = 0;
    }
}

fn write_cell(cell: &mut [u8], candidate: &CandidateKeypoint, layout: &KeypointLayout, fix_resolution: u32) {
    let x_raw = fixed_point_encode(candidate.x as f32, fix_resolution);
    let y_raw = fixed_point_encode(candidate.y as f32, fix_resolution);

    cell[0] = (x_raw & 0xFF) as u8;
    cell[1] = (x_raw >> 8) as u8;
    cell[2] = (y_raw & 0xFF) as u8;
    cell[3] = (y_raw >> 8) as u8;

    cell[4] = encode_lod(candidate.lod);
    cell[5] = encode_orientation(candidate.orientation);
    cell[6] = (candidate.score & 0xFF) as u8;
    cell[7] = (candidate.score >> 8) as u8;

    let descriptor_extra = &mut cell[8..];
    for byte in descriptor_extra.iter_mut() {
        *byte = 0;
    }
    descriptor_extra[..layout.descriptor_size].copy_from_slice(&candidate.descriptor[..layout.descriptor_size]);
    descriptor_extra[layout.descriptor_size..layout.descriptor_size + layout.extra_size]
        .copy_from_slice(&candidate.extra[..layout.extra_size]);
}

fn fixed_point_encode(value: f32, fix_resolution: u32) -> u16 {
    let raw = (value * fix_resolution as f32).round();
    raw.clamp(0.0, (SENTINEL_RAW - 1) as f32) as u16
}

fn fixed_point_decode(raw: u16, fix_resolution: u32) -> f32 {
    raw as f32 / fix_resolution as f32
}

/// Inverse of the decode rule: `lod = -m + (m+h) * lodByte / 255` for
/// `lodByte < 255`, else `lod = 0`.
fn encode_lod(lod: f32) -> u8 {
    let m = LOG2_PYRAMID_MAX_SCALE;
    let h = PYRAMID_MAX_LEVELS;
    let normalized = (lod + m) * 255.0 / (m + h);
    normalized.round().clamp(0.0, 254.0) as u8
}

fn decode_lod(byte: u8) -> f32 {
    if byte >= 255 {
        0.0
    } else {
        let m = LOG2_PYRAMID_MAX_SCALE;
        let h = PYRAMID_MAX_LEVELS;
        -m + (m + h) * f32::from(byte) / 255.0
    }
}

/// Inverse of the decode rule: `orientation = (2*orientationByte - 255) *
/// pi / 255`.
fn encode_orientation(radians: f32) -> u8 {
    let normalized = (radians * 255.0 / PI + 255.0) / 2.0;
    normalized.round().clamp(0.0, 255.0) as u8
}

fn decode_orientation(byte: u8) -> f32 {
    (2.0 * f32::from(byte) - 255.0) * PI / 255.0
}

/// Decode the dense packed wire format back into a host-side keypoint list,
/// stopping at the end-of-list sentinel.
pub fn decode_dense(bytes: &[u8], layout: &KeypointLayout, fix_resolution: u32) -> Vec<Keypoint> {
    let cell_bytes = layout.cell_bytes();
    let mut keypoints = Vec::new();

    let mut offset = 0usize;
    while offset + cell_bytes <= bytes.len() {
        let cell = &bytes[offset..offset + cell_bytes];
        offset += cell_bytes;

        let x_raw = u16::from(cell[0]) | (u16::from(cell[1]) << 8);
        let y_raw = u16::from(cell[2]) | (u16::from(cell[3]) << 8);

        if x_raw == SENTINEL_RAW && y_raw == SENTINEL_RAW {
            break;
        }

        let score = u16::from(cell[6]) | (u16::from(cell[7]) << 8);
        if x_raw == 0 && y_raw == 0 && cell[6] == 0 {
            // Empty-cell skip: not a keypoint, but not the end either.
            continue;
        }

        let payload = &cell[8..];
        if payload.len() < layout.descriptor_size + layout.extra_size {
            // Truncation: not enough room for the configured descriptor and
            // extra payload in this cell; discard it.
            continue;
        }

        let descriptor = payload[..layout.descriptor_size].to_vec();
        let extra = payload[layout.descriptor_size..layout.descriptor_size + layout.extra_size].to_vec();

        keypoints.push(Keypoint {
            position: Point::new(
                fixed_point_decode(x_raw, fix_resolution),
                fixed_point_decode(y_raw, fix_resolution),
            ),
            lod: decode_lod(cell[4]),
            orientation: decode_orientation(cell[5]),
            score,
            descriptor,
            extra,
        });
    }

    keypoints
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn candidate(x: u32, y: u32, score: u16, descriptor_size: usize, extra_size: usize, rng: &mut impl Rng) -> CandidateKeypoint {
        CandidateKeypoint {
            x,
            y,
            corner_score: rng.random_range(1..=255),
            intensity: rng.random_range(0..=255),
            scale_byte: rng.random_range(0..=255),
            lod: rng.random_range(-3.0..10.0),
            orientation: rng.random_range(-PI..PI),
            score,
            descriptor: (0..descriptor_size).map(|_| rng.random()).collect(),
            extra: (0..extra_size).map(|_| rng.random()).collect(),
        }
    }

    #[test]
    fn round_trip_random_keypoints() {
        let mut rng = rand::rng();
        let width = 64u32;
        let height = 64u32;
        let descriptor_size = 32;
        let extra_size = 4;
        let fix_resolution = fix_resolution_for(width.max(height));

        for _ in 0..20 {
            let count = rng.random_range(0..40usize);
            let mut positions: Vec<(u32, u32)> = Vec::new();
            while positions.len() < count {
                let x = rng.random_range(0..width);
                let y = rng.random_range(0..height);
                if !positions.contains(&(x, y)) {
                    positions.push((x, y));
                }
            }
            positions.sort_by_key(|&(x, y)| (y, x));

            let candidates: Vec<_> = positions
                .iter()
                .map(|&(x, y)| candidate(x, y, rng.random(), descriptor_size, extra_size, &mut rng))
                .collect();

            let layout = KeypointLayout::for_capacity(count.max(1), descriptor_size, extra_size);
            let dense = encode_sparse_to_dense(&candidates, width, height, &layout, fix_resolution);
            let decoded = decode_dense(&dense, &layout, fix_resolution);

            assert_eq!(decoded.len(), count, "expected {count} keypoints, got {}", decoded.len());

            let tolerance = 1.0 / fix_resolution as f32;
            for (candidate, decoded) in candidates.iter().zip(decoded.iter()) {
                assert!(
                    (decoded.position.x - candidate.x as f32).abs() <= tolerance,
                    "x mismatch: {} vs {}",
                    decoded.position.x,
                    candidate.x
                );
                assert!((decoded.position.y - candidate.y as f32).abs() <= tolerance);
                assert_eq!(decoded.score, candidate.score);
                assert_eq!(decoded.descriptor, candidate.descriptor);
                assert_eq!(decoded.extra, candidate.extra);
            }
        }
    }

    #[test]
    fn empty_detection_decodes_to_empty_list() {
        let layout = KeypointLayout::for_capacity(16, 0, 0);
        let dense = encode_sparse_to_dense(&[], 16, 16, &layout, fix_resolution_for(16));
        let decoded = decode_dense(&dense, &layout, fix_resolution_for(16));
        assert!(decoded.is_empty());
    }

    #[test]
    fn sentinel_stops_decoding_at_first_null_cell() {
        let layout = KeypointLayout::for_capacity(4, 0, 0);
        let one = candidate(1, 1, 500, 0, 0, &mut rand::rng());
        let dense = encode_sparse_to_dense(&[one], 8, 8, &layout, fix_resolution_for(8));
        let decoded = decode_dense(&dense, &layout, fix_resolution_for(8));
        assert_eq!(decoded.len(), 1);

        // A buffer containing one valid keypoint followed immediately by a
        // sentinel cell must decode as length 1, even if the backing
        // texture has further cells after the sentinel.
        let cell_bytes = layout.cell_bytes();
        let mut truncated = dense[..cell_bytes].to_vec();
        truncated.extend_from_slice(&[0xFF; 4]);
        let decoded_truncated = decode_dense(&truncated, &layout, fix_resolution_for(8));
        assert_eq!(decoded_truncated.len(), 1);
    }

    #[test]
    fn overflow_clips_to_capacity_ordered_by_scan() {
        // Descending-score clipping happens in the Keypoint.Clipper node
        // (see pipeline tests); this codec-level test only checks that
        // encoding never emits more cells than the layout's capacity.
        let mut rng = rand::rng();
        let width = 64;
        let height = 64;
        let mut positions = Vec::new();
        for y in 0..height {
            for x in 0..width {
                positions.push((x, y));
            }
        }
        let candidates: Vec<_> = positions
            .into_iter()
            .take(300)
            .map(|(x, y)| candidate(x, y, rng.random(), 0, 0, &mut rng))
            .collect();

        let layout = KeypointLayout::for_capacity(100, 0, 0);
        let dense = encode_sparse_to_dense(&candidates, width, height, &layout, fix_resolution_for(width.max(height)));
        assert_eq!(dense.len() / layout.cell_bytes(), layout.capacity());
        let decoded = decode_dense(&dense, &layout, fix_resolution_for(width.max(height)));
        assert!(decoded.len() <= layout.capacity());
    }
}
