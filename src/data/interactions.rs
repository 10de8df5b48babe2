use crate::data::dataset::Dataset;
use crate::data::index::UNKNOWN_INDEX;

/// How repeated (row, column) interactions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Merge {
    Sum,
    Mean,
}

/// Compressed sparse rows over positive interactions.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionMatrix {
    n_rows: usize,
    n_cols: usize,
    indptr: Vec<usize>,
    indices: Vec<u32>,
    values: Vec<f32>,
}

impl InteractionMatrix {
    /// Users × items from the dataset's positive records. Sentinel rows and
    /// columns stay empty.
    pub fn user_items(dataset: &Dataset, merge: Merge) -> Self {
        let n_rows = dataset.info().user_index().table_size();
        let n_cols = dataset.info().item_index().table_size();
        let triples = dataset
            .positives()
            .filter(|r| r.user_index != UNKNOWN_INDEX && r.item_index != UNKNOWN_INDEX)
            .map(|r| (r.user_index, r.item_index, r.label))
            .collect();
        Self::from_triples(n_rows, n_cols, triples, merge)
    }

    pub fn from_triples(n_rows: usize, n_cols: usize, mut triples: Vec<(u32, u32, f32)>, merge: Merge) -> Self {
        triples.sort_by_key(|&(r, c, _)| (r, c));

        let mut indptr = vec![0usize; n_rows + 1];
        let mut indices = Vec::with_capacity(triples.len());
        let mut values = Vec::with_capacity(triples.len());
        let mut counts: Vec<u32> = Vec::with_capacity(triples.len());
        let mut last: Option<(u32, u32)> = None;

        for (r, c, v) in triples {
            if last == Some((r, c)) {
                if let (Some(value), Some(count)) = (values.last_mut(), counts.last_mut()) {
                    *value += v;
                    *count += 1;
                }
                continue;
            }
            indptr[r as usize + 1] += 1;
            indices.push(c);
            values.push(v);
            counts.push(1);
            last = Some((r, c));
        }

        if merge == Merge::Mean {
            for (value, &count) in values.iter_mut().zip(&counts) {
                *value /= count as f32;
            }
        }
        for r in 0..n_rows {
            indptr[r + 1] += indptr[r];
        }

        Self {
            n_rows,
            n_cols,
            indptr,
            indices,
            values,
        }
    }

    pub fn transpose(&self) -> Self {
        let mut triples = Vec::with_capacity(self.nnz());
        for r in 0..self.n_rows {
            let (cols, vals) = self.row(r);
            for (&c, &v) in cols.iter().zip(vals) {
                triples.push((c, r as u32, v));
            }
        }
        Self::from_triples(self.n_cols, self.n_rows, triples, Merge::Sum)
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn n_cols(&self) -> usize {
        self.n_cols
    }

    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    pub fn row(&self, r: usize) -> (&[u32], &[f32]) {
        let (start, end) = (self.indptr[r], self.indptr[r + 1]);
        (&self.indices[start..end], &self.values[start..end])
    }

    pub fn row_len(&self, r: usize) -> usize {
        self.indptr[r + 1] - self.indptr[r]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_merged() {
        let m = InteractionMatrix::from_triples(
            3,
            4,
            vec![(2, 1, 1.0), (1, 3, 2.0), (1, 3, 4.0), (1, 0, 1.0)],
            Merge::Sum,
        );
        assert_eq!(m.nnz(), 3);
        assert_eq!(m.row(0), (&[][..], &[][..]));
        assert_eq!(m.row(1), (&[0, 3][..], &[1.0, 6.0][..]));
        assert_eq!(m.row(2), (&[1][..], &[1.0][..]));

        let mean = InteractionMatrix::from_triples(2, 4, vec![(1, 3, 2.0), (1, 3, 4.0)], Merge::Mean);
        assert_eq!(mean.row(1), (&[3][..], &[3.0][..]));
    }

    #[test]
    fn test_transpose() {
        let m = InteractionMatrix::from_triples(3, 3, vec![(1, 2, 1.5), (2, 2, 0.5), (2, 1, 1.0)], Merge::Sum);
        let t = m.transpose();
        assert_eq!(t.n_rows(), 3);
        assert_eq!(t.row(2), (&[1, 2][..], &[1.5, 0.5][..]));
        assert_eq!(t.row(1), (&[2][..], &[1.0][..]));
        assert_eq!(t.row_len(0), 0);
    }
}
