use crate::errors::{RslikeError, RslikeResult};
use indexmap::IndexMap;
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Table of values keyed by name.
///
/// Each column has shape `(nrows, width)`: scalar quantities have a width of one,
/// array-valued derived quantities are flattened along the second axis.
/// Row `i` of every column belongs to the same point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Samples {
    nrows: usize,
    columns: IndexMap<String, Array2<f64>>,
}

impl Samples {
    pub fn new(nrows: usize) -> Self {
        Self {
            nrows,
            columns: IndexMap::new(),
        }
    }

    /// Build a table from scalar columns, which must share their length.
    pub fn from_columns<I, S>(columns: I) -> RslikeResult<Self>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut columns = columns.into_iter().peekable();
        let nrows = columns.peek().map_or(0, |(_, values)| values.len());
        let mut samples = Self::new(nrows);
        for (name, values) in columns {
            samples.insert_scalar(name, values)?;
        }
        Ok(samples)
    }

    /// Build a single-row table from a point.
    pub fn from_point(point: &IndexMap<String, f64>) -> Self {
        let mut samples = Self::new(1);
        for (name, &value) in point {
            samples
                .columns
                .insert(name.clone(), Array2::from_elem((1, 1), value));
        }
        samples
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn is_empty(&self) -> bool {
        self.nrows == 0
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.columns.keys()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Array2<f64>) -> RslikeResult<()> {
        let name = name.into();
        if values.nrows() != self.nrows {
            return Err(RslikeError::Configuration(format!(
                "column '{}' has {} rows, expected {}",
                name,
                values.nrows(),
                self.nrows
            )));
        }
        self.columns.insert(name, values);
        Ok(())
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, values: Vec<f64>) -> RslikeResult<()> {
        let n = values.len();
        let values = Array1::from_vec(values).into_shape((n, 1)).map_err(|e| {
            RslikeError::Error(format!("could not reshape column: {}", e))
        })?;
        self.insert(name, values)
    }

    pub fn get(&self, name: &str) -> Option<ArrayView2<'_, f64>> {
        self.columns.get(name).map(|c| c.view())
    }

    /// First component of a column, i.e. the values of a scalar quantity.
    pub fn scalar(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        self.columns
            .get(name)
            .filter(|c| c.ncols() > 0)
            .map(|c| c.column(0))
    }

    pub fn remove(&mut self, name: &str) -> Option<Array2<f64>> {
        self.columns.shift_remove(name)
    }

    /// Scalar values of row `index`, keyed by column.
    ///
    /// Array-valued columns are skipped.
    pub fn point(&self, index: usize) -> IndexMap<String, f64> {
        self.columns
            .iter()
            .filter(|(_, c)| c.ncols() == 1)
            .map(|(name, c)| (name.clone(), c[[index, 0]]))
            .collect()
    }

    /// Copy of rows `start..end`.
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        Self {
            nrows: end - start,
            columns: self
                .columns
                .iter()
                .map(|(name, c)| (name.clone(), c.slice(s![start..end, ..]).to_owned()))
                .collect(),
        }
    }

    /// Subset of columns, in the requested order.
    pub fn select(&self, names: &[String]) -> RslikeResult<Self> {
        let mut samples = Self::new(self.nrows);
        for name in names {
            let column = self
                .columns
                .get(name)
                .ok_or_else(|| RslikeError::UnknownParameter(name.clone()))?;
            samples.columns.insert(name.clone(), column.clone());
        }
        Ok(samples)
    }

    /// Stack tables row-wise, preserving row order.
    ///
    /// Every table must hold the same columns with the same widths.
    pub fn concatenate(tables: &[Samples]) -> RslikeResult<Self> {
        let first = match tables.iter().find(|t| !t.columns.is_empty()) {
            Some(first) => first,
            None => {
                return Ok(Self::new(tables.iter().map(|t| t.nrows).sum()));
            }
        };
        let mut result = Self::new(tables.iter().map(|t| t.nrows).sum());
        for name in first.columns.keys() {
            let mut views = Vec::with_capacity(tables.len());
            for table in tables.iter().filter(|t| t.nrows > 0) {
                let column = table
                    .columns
                    .get(name)
                    .ok_or_else(|| RslikeError::UnknownParameter(name.clone()))?;
                views.push(column.view());
            }
            let column = if views.is_empty() {
                first.columns[name].clone()
            } else {
                concatenate(Axis(0), &views).map_err(|e| {
                    RslikeError::Error(format!("cannot concatenate column '{}': {}", name, e))
                })?
            };
            result.insert(name.clone(), column)?;
        }
        Ok(result)
    }

    /// Split rows into `n` contiguous chunks whose sizes differ by at most one.
    ///
    /// The first `nrows % n` chunks hold the extra rows.
    pub fn split_rows(&self, n: usize) -> Vec<Self> {
        let n = n.max(1);
        let base = self.nrows / n;
        let extra = self.nrows % n;
        let mut start = 0;
        (0..n)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let chunk = self.slice_rows(start, start + len);
                start += len;
                chunk
            })
            .collect()
    }
}
