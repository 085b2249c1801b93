//! Chunk layout geometry.
//!
//! A dataset's N-d array is tiled into chunks of shape `layout`. The
//! value engine decomposes a hyperslab selection into the set of
//! chunks it intersects; for each chunk the *chunk selection* is the
//! intersection in dataset coordinates, the *chunk coverage* is the
//! same selection made chunk-relative, and the *data coverage* is the
//! region of the (dense) request array the chunk contributes.

use crate::error::{ServiceError, ServiceResult};
use crate::idutil;
use crate::slab::{Selection, Slice};

pub const CHUNK_BASE: u64 = 16 * 1024;
pub const CHUNK_MIN: u64 = 8 * 1024;
pub const CHUNK_MAX: u64 = 1024 * 1024;

/// Guess a chunk layout for a dataset from its shape and element
/// size: aim for a power-of-two fraction of each axis with a total
/// byte size inside `[CHUNK_MIN, CHUNK_MAX]`, slightly favoring the
/// trailing axes. Unlimited extents guess 1024.
pub fn guess_chunk(dims: &[u64], itemsize: usize) -> ServiceResult<Vec<u64>> {
    if dims.is_empty() {
        return Err(ServiceError::BadRequest("no chunking for scalar datasets".to_string()));
    }
    let mut chunks: Vec<u64> = dims.iter().map(|d| if *d == 0 { 1024 } else { *d }).collect();
    let ndims = chunks.len();

    let dset_bytes = chunks.iter().product::<u64>() as f64 * itemsize as f64;
    let mut target = CHUNK_BASE as f64 * 2f64.powf((dset_bytes / (1024.0 * 1024.0)).log10());
    if target > CHUNK_MAX as f64 {
        target = CHUNK_MAX as f64;
    } else if target < CHUNK_MIN as f64 {
        target = CHUNK_MIN as f64;
    }

    let mut idx = 0usize;
    loop {
        let chunk_bytes = chunks.iter().product::<u64>() as f64 * itemsize as f64;
        if (chunk_bytes < target || (chunk_bytes - target).abs() / target < 0.5)
            && chunk_bytes < CHUNK_MAX as f64
        {
            break;
        }
        if chunks.iter().product::<u64>() == 1 {
            // element larger than CHUNK_MAX
            break;
        }
        chunks[idx % ndims] = (chunks[idx % ndims] + 1) / 2;
        idx += 1;
    }
    Ok(chunks)
}

/// Validate a user supplied layout against the dataset shape and the
/// configured chunk byte bounds; extents are clamped to the shape.
pub fn validate_layout(
    layout: &[u64],
    dims: &[u64],
    itemsize: usize,
    min_chunk_size: usize,
    max_chunk_size: usize,
) -> ServiceResult<Vec<u64>> {
    if layout.len() != dims.len() {
        return Err(ServiceError::BadRequest(format!(
            "layout rank {} does not match shape rank {}",
            layout.len(),
            dims.len()
        )));
    }
    let mut out = Vec::with_capacity(layout.len());
    for (l, d) in layout.iter().zip(dims) {
        if *l == 0 {
            return Err(ServiceError::BadRequest("zero chunk extent".to_string()));
        }
        out.push(if *d > 0 && l > d { *d } else { *l });
    }
    let chunk_bytes = out.iter().product::<u64>() as usize * itemsize;
    if chunk_bytes < min_chunk_size {
        return Err(ServiceError::BadRequest(format!(
            "chunk size {} below minimum {}",
            chunk_bytes, min_chunk_size
        )));
    }
    if chunk_bytes > max_chunk_size {
        return Err(ServiceError::BadRequest(format!(
            "chunk size {} above maximum {}",
            chunk_bytes, max_chunk_size
        )));
    }
    Ok(out)
}

/// Distinct chunk indices a slice intersects along one dimension.
fn dim_chunk_indices(s: &Slice, c: u64) -> Vec<u64> {
    if s.stop <= s.start {
        return Vec::new();
    }
    if s.step == 1 {
        let first = s.start / c;
        let last = (s.stop + c - 1) / c;
        (first..last).collect()
    } else {
        let mut out = Vec::new();
        let mut point = s.start;
        while point < s.stop {
            let index = point / c;
            if out.last() != Some(&index) {
                out.push(index);
            }
            point += s.step;
        }
        out
    }
}

/// Number of chunks a selection touches.
pub fn num_chunks(sel: &Selection, layout: &[u64]) -> usize {
    let mut total = 1usize;
    for (s, c) in sel.0.iter().zip(layout) {
        let count = dim_chunk_indices(s, *c).len();
        if count == 0 {
            return 0;
        }
        total *= count;
    }
    total
}

/// Ids of every chunk the selection touches, in row-major index
/// order.
pub fn chunk_ids(dset_id: &str, sel: &Selection, layout: &[u64]) -> ServiceResult<Vec<String>> {
    idutil::validate_id(dset_id, Some(idutil::ObjClass::Dataset))?;
    let per_dim: Vec<Vec<u64>> = sel
        .0
        .iter()
        .zip(layout)
        .map(|(s, c)| dim_chunk_indices(s, *c))
        .collect();
    if per_dim.iter().any(Vec::is_empty) {
        return Ok(Vec::new());
    }

    let mut ids = Vec::new();
    let rank = per_dim.len();
    let mut cursor = vec![0usize; rank];
    loop {
        let index: Vec<u64> = cursor.iter().zip(&per_dim).map(|(i, dim)| dim[*i]).collect();
        ids.push(idutil::chunk_id_for(dset_id, &index));

        let mut dim = rank;
        loop {
            if dim == 0 {
                return Ok(ids);
            }
            dim -= 1;
            cursor[dim] += 1;
            if cursor[dim] < per_dim[dim].len() {
                break;
            }
            cursor[dim] = 0;
        }
    }
}

/// Origin of a chunk in dataset coordinates.
pub fn chunk_coordinate(chunk_id: &str, layout: &[u64]) -> ServiceResult<Vec<u64>> {
    let index = idutil::chunk_index(chunk_id)?;
    if index.len() != layout.len() {
        return Err(ServiceError::BadRequest(format!(
            "chunk id rank does not match layout: {}",
            chunk_id
        )));
    }
    Ok(index.iter().zip(layout).map(|(i, c)| i * c).collect())
}

/// Intersection of the selection with the chunk's extent, in dataset
/// coordinates. The result walks the same strided points the outer
/// selection does.
pub fn chunk_selection(
    chunk_id: &str,
    sel: &Selection,
    layout: &[u64],
) -> ServiceResult<Selection> {
    let index = idutil::chunk_index(chunk_id)?;
    if index.len() != layout.len() || sel.rank() != layout.len() {
        return Err(ServiceError::BadRequest("selection rank mismatch".to_string()));
    }
    let mut slices = Vec::with_capacity(layout.len());
    for ((s, c), i) in sel.0.iter().zip(layout).zip(&index) {
        let origin = i * c;
        let end = origin + c;
        if s.start >= end || s.stop <= origin {
            return Err(ServiceError::BadRequest(format!(
                "chunk {} does not intersect selection",
                chunk_id
            )));
        }
        // first selected point at or after the chunk origin
        let start = if s.start >= origin {
            s.start
        } else {
            let skipped = (origin - s.start + s.step - 1) / s.step;
            s.start + skipped * s.step
        };
        let stop = s.stop.min(end);
        if start >= stop {
            return Err(ServiceError::BadRequest(format!(
                "chunk {} does not intersect selection",
                chunk_id
            )));
        }
        slices.push(Slice { start, stop, step: s.step });
    }
    Ok(Selection(slices))
}

/// Chunk-relative form of `chunk_selection`.
pub fn chunk_coverage(chunk_id: &str, sel: &Selection, layout: &[u64]) -> ServiceResult<Selection> {
    let chunk_sel = chunk_selection(chunk_id, sel, layout)?;
    let index = idutil::chunk_index(chunk_id)?;
    let mut slices = Vec::with_capacity(layout.len());
    for ((s, c), i) in chunk_sel.0.iter().zip(layout).zip(&index) {
        let offset = i * c;
        slices.push(Slice { start: s.start - offset, stop: s.stop - offset, step: s.step });
    }
    Ok(Selection(slices))
}

/// Region of the dense request array this chunk contributes, as
/// indices into the selection's shape.
pub fn data_coverage(chunk_id: &str, sel: &Selection, layout: &[u64]) -> ServiceResult<Selection> {
    let chunk_sel = chunk_selection(chunk_id, sel, layout)?;
    let mut slices = Vec::with_capacity(layout.len());
    for (c, s) in chunk_sel.0.iter().zip(&sel.0) {
        let start = (c.start - s.start) / s.step;
        let count = c.count();
        slices.push(Slice::new(start, start + count));
    }
    Ok(Selection(slices))
}

/// Chunk id containing the given dataset coordinate.
pub fn chunk_id_for_point(dset_id: &str, coord: &[u64], layout: &[u64]) -> ServiceResult<String> {
    if coord.len() != layout.len() {
        return Err(ServiceError::BadRequest("point rank mismatch".to_string()));
    }
    let index: Vec<u64> = coord.iter().zip(layout).map(|(p, c)| p / c).collect();
    Ok(idutil::chunk_id_for(dset_id, &index))
}

#[cfg(test)]
mod test {
    use super::*;

    const DSET_ID: &str = "d-12345678-1234-1234-1234-1234567890ab";

    fn sel(parts: &[(u64, u64, u64)]) -> Selection {
        Selection(parts.iter().map(|(a, b, s)| Slice { start: *a, stop: *b, step: *s }).collect())
    }

    #[test]
    fn test_guess_chunk_bounds() {
        for (dims, itemsize) in &[
            (vec![100u64], 4usize),
            (vec![1000, 1000], 8),
            (vec![10, 10, 10], 2),
            (vec![0, 500], 4),
            (vec![1_000_000_000], 8),
        ] {
            let layout = guess_chunk(dims, *itemsize).unwrap();
            assert_eq!(layout.len(), dims.len());
            let bytes = layout.iter().product::<u64>() as usize * itemsize;
            assert!(bytes <= CHUNK_MAX as usize, "dims {:?}: {} bytes", dims, bytes);
            for (l, d) in layout.iter().zip(dims) {
                if *d > 0 {
                    assert!(*l <= *d || *d == 0);
                }
                assert!(*l >= 1);
            }
        }
    }

    #[test]
    fn test_validate_layout() {
        let layout = validate_layout(&[10, 10], &[45, 54], 4, 40, 4 * 1024 * 1024).unwrap();
        assert_eq!(layout, vec![10, 10]);

        // clamped to shape
        let layout = validate_layout(&[100, 10], &[45, 54], 4, 40, 4 * 1024 * 1024).unwrap();
        assert_eq!(layout, vec![45, 10]);

        assert!(validate_layout(&[1], &[45], 4, 40, 1024).is_err()); // too small
        assert!(validate_layout(&[1000, 1000], &[1000, 1000], 8, 40, 1024).is_err()); // too big
        assert!(validate_layout(&[10], &[45, 54], 4, 40, 1024).is_err()); // rank
    }

    #[test]
    fn test_num_chunks() {
        // [22:23, 2:52] over 10x10 tiles: 1 x 6 chunks
        assert_eq!(num_chunks(&sel(&[(22, 23, 1), (2, 52, 1)]), &[10, 10]), 6);
        // aligned selection
        assert_eq!(num_chunks(&sel(&[(0, 20, 1)]), &[10]), 2);
        // interior fragment
        assert_eq!(num_chunks(&sel(&[(5, 15, 1)]), &[10]), 2);
        // null selection
        assert_eq!(num_chunks(&sel(&[(5, 5, 1)]), &[10]), 0);
        // strided: points 0, 4, 8, 12, 16 over 10-tiles -> chunks 0, 1
        assert_eq!(num_chunks(&sel(&[(0, 17, 4)]), &[10]), 2);
        // strided past whole chunks: points 0, 25 -> chunks 0, 2
        assert_eq!(num_chunks(&sel(&[(0, 26, 25)]), &[10]), 2);
    }

    #[test]
    fn test_chunk_ids_order() {
        let ids = chunk_ids(DSET_ID, &sel(&[(5, 25, 1), (15, 25, 1)]), &[10, 10]).unwrap();
        assert_eq!(
            ids,
            vec![
                format!("c-{}_0_1", &DSET_ID[2..]),
                format!("c-{}_0_2", &DSET_ID[2..]),
                format!("c-{}_1_1", &DSET_ID[2..]),
                format!("c-{}_1_2", &DSET_ID[2..]),
                format!("c-{}_2_1", &DSET_ID[2..]),
                format!("c-{}_2_2", &DSET_ID[2..]),
            ]
        );
    }

    #[test]
    fn test_chunk_selection_and_coverage() {
        let layout = [10, 10];
        let user = sel(&[(22, 23, 1), (2, 52, 1)]);
        let chunk_id = idutil::chunk_id_for(DSET_ID, &[2, 1]);

        let chunk_sel = chunk_selection(&chunk_id, &user, &layout).unwrap();
        assert_eq!(chunk_sel, sel(&[(22, 23, 1), (10, 20, 1)]));

        let coverage = chunk_coverage(&chunk_id, &user, &layout).unwrap();
        assert_eq!(coverage, sel(&[(2, 3, 1), (0, 10, 1)]));

        let data = data_coverage(&chunk_id, &user, &layout).unwrap();
        assert_eq!(data, sel(&[(0, 1, 1), (8, 18, 1)]));
    }

    #[test]
    fn test_coverage_partitions_selection() {
        // the per-chunk data coverages tile the selection shape
        // exactly, with no overlap
        let layout = [10, 10];
        let user = sel(&[(5, 38, 3), (7, 44, 5)]);
        let shape = user.shape();
        let mut seen = vec![false; (shape[0] * shape[1]) as usize];

        for chunk_id in chunk_ids(DSET_ID, &user, &layout).unwrap() {
            let data = data_coverage(&chunk_id, &user, &layout).unwrap();
            let chunk = chunk_coverage(&chunk_id, &user, &layout).unwrap();
            assert_eq!(data.num_elements(), chunk.num_elements());
            for i in data.0[0].start..data.0[0].stop {
                for j in data.0[1].start..data.0[1].stop {
                    let flat = (i * shape[1] + j) as usize;
                    assert!(!seen[flat], "overlap at ({}, {})", i, j);
                    seen[flat] = true;
                }
            }
        }
        assert!(seen.iter().all(|s| *s), "selection not fully covered");
    }

    #[test]
    fn test_chunk_coordinate() {
        let chunk_id = idutil::chunk_id_for(DSET_ID, &[6, 4]);
        assert_eq!(chunk_coordinate(&chunk_id, &[10, 10]).unwrap(), vec![60, 40]);
    }

    #[test]
    fn test_chunk_id_for_point() {
        let id = chunk_id_for_point(DSET_ID, &[25, 3], &[10, 10]).unwrap();
        assert_eq!(id, idutil::chunk_id_for(DSET_ID, &[2, 0]));
    }
}
