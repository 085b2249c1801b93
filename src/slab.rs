//! N-dimensional byte arrays and hyperslab selections.
//!
//! A `Slab` is a C-order buffer of fixed width elements; it is the
//! in-memory form of a chunk and of every value request/response. A
//! `Selection` is one `Slice` per dimension. The strided copy between
//! a slab and a selection of another slab is the only data path the
//! value engine uses.

use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub start: u64,
    pub stop: u64,
    pub step: u64,
}

impl Slice {
    pub fn new(start: u64, stop: u64) -> Self {
        Slice { start, stop, step: 1 }
    }

    /// Number of points the slice selects.
    pub fn count(&self) -> u64 {
        if self.stop <= self.start {
            0
        } else {
            (self.stop - self.start + self.step - 1) / self.step
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection(pub Vec<Slice>);

impl Selection {
    pub fn whole(dims: &[u64]) -> Self {
        Selection(dims.iter().map(|d| Slice::new(0, *d)).collect())
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn shape(&self) -> Vec<u64> {
        self.0.iter().map(Slice::count).collect()
    }

    pub fn num_elements(&self) -> u64 {
        self.0.iter().map(Slice::count).product()
    }

    /// Parse the `select=[0:10, 2:8:2, 5]` query syntax. A missing
    /// parameter selects everything. Bounds are checked against the
    /// dataset extents.
    pub fn parse(param: Option<&str>, dims: &[u64]) -> ServiceResult<Selection> {
        let raw = match param {
            None => return Ok(Selection::whole(dims)),
            Some(raw) => raw.trim(),
        };
        let inner = raw
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| ServiceError::BadRequest(format!("invalid select: {}", raw)))?;

        let parts: Vec<&str> = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner.split(',').collect()
        };
        if parts.len() != dims.len() {
            return Err(ServiceError::BadRequest(format!(
                "select rank {} does not match dataset rank {}",
                parts.len(),
                dims.len()
            )));
        }

        let mut slices = Vec::with_capacity(dims.len());
        for (part, dim) in parts.iter().zip(dims) {
            slices.push(parse_dim(part.trim(), *dim)?);
        }
        Ok(Selection(slices))
    }

    /// Re-serialize for a sub-request query param.
    pub fn to_param(&self) -> String {
        let mut out = String::from("[");
        for (i, s) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if s.step == 1 {
                out.push_str(&format!("{}:{}", s.start, s.stop));
            } else {
                out.push_str(&format!("{}:{}:{}", s.start, s.stop, s.step));
            }
        }
        out.push(']');
        out
    }
}

fn parse_dim(part: &str, dim: u64) -> ServiceResult<Slice> {
    let err = || ServiceError::BadRequest(format!("invalid select component: {}", part));

    if part == ":" {
        return Ok(Slice::new(0, dim));
    }
    if !part.contains(':') {
        let index: u64 = part.parse().map_err(|_| err())?;
        if index >= dim {
            return Err(ServiceError::BadRequest(format!(
                "select index {} out of bounds ({})",
                index, dim
            )));
        }
        return Ok(Slice::new(index, index + 1));
    }

    let fields: Vec<&str> = part.split(':').collect();
    if fields.len() > 3 {
        return Err(err());
    }
    let start: u64 = if fields[0].is_empty() { 0 } else { fields[0].parse().map_err(|_| err())? };
    let stop: u64 = if fields[1].is_empty() { dim } else { fields[1].parse().map_err(|_| err())? };
    let step: u64 = if fields.len() == 3 && !fields[2].is_empty() {
        fields[2].parse().map_err(|_| err())?
    } else {
        1
    };
    if step == 0 {
        return Err(err());
    }
    if stop > dim || start > stop {
        return Err(ServiceError::BadRequest(format!(
            "select range {}:{} out of bounds ({})",
            start, stop, dim
        )));
    }
    Ok(Slice { start, stop, step })
}

#[derive(Debug, Clone, PartialEq)]
pub struct Slab {
    dims: Vec<u64>,
    itemsize: usize,
    data: Vec<u8>,
}

impl Slab {
    pub fn zeroed(dims: &[u64], itemsize: usize) -> Self {
        let count = dims.iter().product::<u64>() as usize;
        Slab { dims: dims.to_vec(), itemsize, data: vec![0u8; count * itemsize] }
    }

    /// A slab with every element set to `fill`.
    pub fn filled(dims: &[u64], fill: &[u8]) -> Self {
        let count = dims.iter().product::<u64>() as usize;
        let mut data = Vec::with_capacity(count * fill.len());
        for _ in 0..count {
            data.extend_from_slice(fill);
        }
        Slab { dims: dims.to_vec(), itemsize: fill.len(), data }
    }

    pub fn from_bytes(dims: &[u64], itemsize: usize, data: Vec<u8>) -> ServiceResult<Self> {
        let expected = dims.iter().product::<u64>() as usize * itemsize;
        if data.len() != expected {
            return Err(ServiceError::BadRequest(format!(
                "expected {} bytes, got {}",
                expected,
                data.len()
            )));
        }
        Ok(Slab { dims: dims.to_vec(), itemsize, data })
    }

    pub fn dims(&self) -> &[u64] {
        &self.dims
    }

    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product::<u64>() as usize
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Element strides in elements, C order.
    fn strides(&self) -> Vec<u64> {
        let rank = self.dims.len();
        let mut strides = vec![1u64; rank];
        for i in (0..rank.saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    fn check_selection(&self, sel: &Selection) -> ServiceResult<()> {
        if sel.rank() != self.dims.len() {
            return Err(ServiceError::BadRequest(format!(
                "selection rank {} does not match array rank {}",
                sel.rank(),
                self.dims.len()
            )));
        }
        for (s, dim) in sel.0.iter().zip(&self.dims) {
            if s.stop > *dim {
                return Err(ServiceError::BadRequest(format!(
                    "selection {}:{} out of bounds ({})",
                    s.start, s.stop, dim
                )));
            }
        }
        Ok(())
    }

    fn element_offset(&self, coord: &[u64]) -> ServiceResult<usize> {
        if coord.len() != self.dims.len() {
            return Err(ServiceError::BadRequest("coordinate rank mismatch".to_string()));
        }
        let strides = self.strides();
        let mut offset = 0u64;
        for ((c, dim), stride) in coord.iter().zip(&self.dims).zip(&strides) {
            if c >= dim {
                return Err(ServiceError::BadRequest(format!(
                    "coordinate {} out of bounds ({})",
                    c, dim
                )));
            }
            offset += c * stride;
        }
        Ok(offset as usize * self.itemsize)
    }

    pub fn get_point(&self, coord: &[u64]) -> ServiceResult<&[u8]> {
        let offset = self.element_offset(coord)?;
        Ok(&self.data[offset..offset + self.itemsize])
    }

    pub fn set_point(&mut self, coord: &[u64], value: &[u8]) -> ServiceResult<()> {
        if value.len() != self.itemsize {
            return Err(ServiceError::BadRequest("element size mismatch".to_string()));
        }
        let offset = self.element_offset(coord)?;
        self.data[offset..offset + self.itemsize].copy_from_slice(value);
        Ok(())
    }

    /// Copy the selected region out into a densely packed slab of the
    /// selection's shape.
    pub fn read_selection(&self, sel: &Selection) -> ServiceResult<Slab> {
        self.check_selection(sel)?;
        let out_dims = sel.shape();
        let mut out = Slab::zeroed(&out_dims, self.itemsize);

        let count = out.num_elements();
        if count == 0 {
            return Ok(out);
        }

        let strides = self.strides();
        let rank = self.dims.len();
        // walk the selection with an odometer over all dims but the
        // last; the innermost run is copied element-wise (or as one
        // memcpy when step == 1)
        let inner = &sel.0[rank - 1];
        let inner_count = inner.count() as usize;
        let mut index = vec![0u64; rank - 1];
        let mut out_pos = 0usize;
        loop {
            let mut base = 0u64;
            for (dim, i) in index.iter().enumerate() {
                let s = &sel.0[dim];
                base += (s.start + i * s.step) * strides[dim];
            }
            base += inner.start * strides[rank - 1];

            if inner.step == 1 {
                let src = base as usize * self.itemsize;
                let len = inner_count * self.itemsize;
                out.data[out_pos..out_pos + len].copy_from_slice(&self.data[src..src + len]);
                out_pos += len;
            } else {
                for k in 0..inner_count as u64 {
                    let src = (base + k * inner.step * strides[rank - 1]) as usize * self.itemsize;
                    out.data[out_pos..out_pos + self.itemsize]
                        .copy_from_slice(&self.data[src..src + self.itemsize]);
                    out_pos += self.itemsize;
                }
            }

            // advance odometer
            let mut dim = rank - 1;
            loop {
                if dim == 0 {
                    return Ok(out);
                }
                dim -= 1;
                index[dim] += 1;
                if index[dim] < sel.0[dim].count() {
                    break;
                }
                index[dim] = 0;
            }
        }
    }

    /// Scatter a densely packed slab into the selected region.
    pub fn write_selection(&mut self, sel: &Selection, src: &Slab) -> ServiceResult<()> {
        self.check_selection(sel)?;
        if src.itemsize != self.itemsize {
            return Err(ServiceError::BadRequest("element size mismatch".to_string()));
        }
        if sel.num_elements() as usize != src.num_elements() {
            return Err(ServiceError::BadRequest(format!(
                "selection has {} elements but data has {}",
                sel.num_elements(),
                src.num_elements()
            )));
        }
        if src.num_elements() == 0 {
            return Ok(());
        }

        let strides = self.strides();
        let rank = self.dims.len();
        let inner = &sel.0[rank - 1];
        let inner_count = inner.count() as usize;
        let mut index = vec![0u64; rank - 1];
        let mut src_pos = 0usize;
        loop {
            let mut base = 0u64;
            for (dim, i) in index.iter().enumerate() {
                let s = &sel.0[dim];
                base += (s.start + i * s.step) * strides[dim];
            }
            base += inner.start * strides[rank - 1];

            if inner.step == 1 {
                let dst = base as usize * self.itemsize;
                let len = inner_count * self.itemsize;
                self.data[dst..dst + len].copy_from_slice(&src.data[src_pos..src_pos + len]);
                src_pos += len;
            } else {
                for k in 0..inner_count as u64 {
                    let dst = (base + k * inner.step * strides[rank - 1]) as usize * self.itemsize;
                    self.data[dst..dst + self.itemsize]
                        .copy_from_slice(&src.data[src_pos..src_pos + self.itemsize]);
                    src_pos += self.itemsize;
                }
            }

            let mut dim = rank - 1;
            loop {
                if dim == 0 {
                    return Ok(());
                }
                dim -= 1;
                index[dim] += 1;
                if index[dim] < sel.0[dim].count() {
                    break;
                }
                index[dim] = 0;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn slab_1d(values: &[i32]) -> Slab {
        let mut data = Vec::new();
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Slab::from_bytes(&[values.len() as u64], 4, data).unwrap()
    }

    fn values_of(slab: &Slab) -> Vec<i32> {
        slab.as_bytes()
            .chunks(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn test_slice_count() {
        assert_eq!(Slice::new(2, 8).count(), 6);
        assert_eq!(Slice { start: 2, stop: 8, step: 2 }.count(), 3);
        assert_eq!(Slice { start: 2, stop: 9, step: 2 }.count(), 4);
        assert_eq!(Slice::new(5, 5).count(), 0);
    }

    #[test]
    fn test_parse_select() {
        let dims = [10, 20];
        let sel = Selection::parse(Some("[2:8, 0:20]"), &dims).unwrap();
        assert_eq!(sel.shape(), vec![6, 20]);

        let sel = Selection::parse(Some("[:, 5]"), &dims).unwrap();
        assert_eq!(sel.0[0], Slice::new(0, 10));
        assert_eq!(sel.0[1], Slice::new(5, 6));

        let sel = Selection::parse(Some("[1:9:3, :]"), &dims).unwrap();
        assert_eq!(sel.0[0], Slice { start: 1, stop: 9, step: 3 });

        let sel = Selection::parse(None, &dims).unwrap();
        assert_eq!(sel, Selection::whole(&dims));

        assert!(Selection::parse(Some("[0:11, :]"), &dims).is_err());
        assert!(Selection::parse(Some("[0:5]"), &dims).is_err());
        assert!(Selection::parse(Some("0:5, 0:5"), &dims).is_err());
        assert!(Selection::parse(Some("[0:5:0, :]"), &dims).is_err());
    }

    #[test]
    fn test_select_param_round_trip() {
        let dims = [10, 20];
        let sel = Selection::parse(Some("[2:8,1:9:3]"), &dims).unwrap();
        let back = Selection::parse(Some(&sel.to_param()), &dims).unwrap();
        assert_eq!(sel, back);
    }

    #[test]
    fn test_read_selection_1d() {
        let slab = slab_1d(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        let sel = Selection::parse(Some("[2:8]"), &[10]).unwrap();
        let out = slab.read_selection(&sel).unwrap();
        assert_eq!(values_of(&out), vec![2, 3, 4, 5, 6, 7]);

        let sel = Selection::parse(Some("[1:10:4]"), &[10]).unwrap();
        let out = slab.read_selection(&sel).unwrap();
        assert_eq!(values_of(&out), vec![1, 5, 9]);
    }

    #[test]
    fn test_write_selection_2d() {
        let mut slab = Slab::zeroed(&[4, 4], 4);
        let sel = Selection::parse(Some("[1:3, 1:3]"), &[4, 4]).unwrap();
        let src = slab_1d(&[1, 2, 3, 4]);
        let src = Slab::from_bytes(&[2, 2], 4, src.into_bytes()).unwrap();
        slab.write_selection(&sel, &src).unwrap();

        let all = slab.read_selection(&Selection::whole(&[4, 4])).unwrap();
        assert_eq!(
            values_of(&all),
            vec![0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_round_trip_strided() {
        let mut slab = Slab::zeroed(&[6, 6], 4);
        let sel = Selection::parse(Some("[0:6:2, 1:6:2]"), &[6, 6]).unwrap();
        assert_eq!(sel.shape(), vec![3, 3]);
        let src = Slab::from_bytes(&[3, 3], 4, slab_1d(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).into_bytes())
            .unwrap();
        slab.write_selection(&sel, &src).unwrap();
        let out = slab.read_selection(&sel).unwrap();
        assert_eq!(values_of(&out), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_point_access() {
        let mut slab = Slab::zeroed(&[3, 3], 4);
        slab.set_point(&[1, 2], &7i32.to_le_bytes()).unwrap();
        assert_eq!(slab.get_point(&[1, 2]).unwrap(), &7i32.to_le_bytes());
        assert_eq!(slab.get_point(&[0, 0]).unwrap(), &0i32.to_le_bytes());
        assert!(slab.get_point(&[3, 0]).is_err());
    }

    #[test]
    fn test_filled() {
        let slab = Slab::filled(&[2, 2], &42i32.to_le_bytes());
        assert_eq!(values_of(&slab), vec![42, 42, 42, 42]);
    }

    #[test]
    fn test_from_bytes_length_check() {
        assert!(Slab::from_bytes(&[3], 4, vec![0u8; 11]).is_err());
    }
}
