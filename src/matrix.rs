use std::ops::Index;
use std::ops::IndexMut;

/// Storage width for the large per-position tables (emissions, posteriors).
///
/// All arithmetic is carried out in `f64`; only the stored values are
/// narrowed or kept. The width is picked once at startup (see
/// `FitOptions::high_precision`) and threaded through the generic code.
pub trait Real: Copy + Default + PartialOrd + Send + Sync + std::fmt::Debug + 'static {
    fn from_f64(x: f64) -> Self;
    fn to_f64(self) -> f64;
    fn none() -> Self;
    fn is_none(&self) -> bool;
    fn as_option(&self) -> Option<f64> {
        match self.is_none() {
            true => None,
            false => Some(self.to_f64()),
        }
    }
}

impl Real for f32 {
    fn from_f64(x: f64) -> Self {
        x as f32
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn none() -> Self {
        f32::NAN
    }
    fn is_none(&self) -> bool {
        self.is_nan()
    }
}

impl Real for f64 {
    fn from_f64(x: f64) -> Self {
        x
    }
    fn to_f64(self) -> f64 {
        self
    }
    fn none() -> Self {
        f64::NAN
    }
    fn is_none(&self) -> bool {
        self.is_nan()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Matrix<T>
where
    T: Real,
{
    data: Vec<T>,
    ncols: usize,
    nrows: usize,
}

impl<T> Matrix<T>
where
    T: Real,
{
    pub fn from_shape(nrows: usize, ncols: usize, init_val: T) -> Self {
        let data = vec![init_val; nrows * ncols];
        Self { data, ncols, nrows }
    }

    pub fn from_shape_vec(nrows: usize, ncols: usize, data: Vec<T>) -> Self {
        assert_eq!(data.len(), nrows * ncols);
        Self { data, ncols, nrows }
    }

    pub fn resize_and_clear(&mut self, nrows: usize, ncols: usize, init_val: T) {
        self.data.clear();
        self.data.resize(nrows * ncols, init_val);
        self.ncols = ncols;
        self.nrows = nrows;
    }

    pub fn get_nrows(&self) -> usize {
        self.nrows
    }
    pub fn get_ncols(&self) -> usize {
        self.ncols
    }

    /// values of one column (e.g. all states at one position) widened to f64
    pub fn get_col_iter(&self, col: usize) -> impl Iterator<Item = f64> + '_ {
        (0..self.nrows).map(move |row| self.get_at(row, col))
    }

    pub fn get_at(&self, row: usize, col: usize) -> f64 {
        self.data[self.ncols * row + col].to_f64()
    }

    pub fn set_at(&mut self, row: usize, col: usize, val: f64) {
        self.data[self.ncols * row + col] = T::from_f64(val);
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data[..]
    }
}

impl<T> Index<usize> for Matrix<T>
where
    T: Real,
{
    type Output = [T];
    fn index(&self, index: usize) -> &Self::Output {
        let s = index * self.ncols;
        let e = s + self.ncols;
        &self.data[s..e]
    }
}

impl<T> IndexMut<usize> for Matrix<T>
where
    T: Real,
{
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        let s = index * self.ncols;
        let e = s + self.ncols;
        &mut self.data[s..e]
    }
}

pub struct MatrixBuilder<T: Real> {
    data: Vec<T>,
    ncols: usize,
}
impl<T> MatrixBuilder<T>
where
    T: Real,
{
    pub fn new(ncols: usize) -> Self {
        Self {
            data: vec![],
            ncols,
        }
    }

    pub fn push(&mut self, val: Option<f64>) {
        match val {
            Some(val) => self.data.push(T::from_f64(val)),
            None => self.data.push(T::none()),
        }
    }

    pub fn nrows(&self) -> usize {
        match self.ncols {
            0 => 0,
            n => self.data.len() / n,
        }
    }

    pub fn finish(&mut self, nrows: usize) -> Matrix<T> {
        assert_eq!(self.data.len(), nrows * self.ncols);
        Matrix {
            data: std::mem::take(&mut self.data),
            ncols: self.ncols,
            nrows,
        }
    }
}

#[test]
fn test_matrix_storage_width() {
    let mut m = Matrix::<f32>::from_shape(3, 4, 0.0);
    m.set_at(2, 1, 0.1);
    assert!((m.get_at(2, 1) - 0.1).abs() < 1e-7);
    assert_eq!(m[2].len(), 4);
    assert_eq!(m.get_col_iter(1).count(), 3);

    let mut m = Matrix::<f64>::from_shape(2, 2, 0.0);
    m.set_at(1, 1, 0.1);
    assert_eq!(m.get_at(1, 1), 0.1);
    assert!(f64::none().as_option().is_none());
}

#[test]
fn test_matrix_builder() {
    let mut b = MatrixBuilder::<f64>::new(2);
    b.push(Some(1.0));
    b.push(None);
    b.push(Some(3.0));
    b.push(Some(4.0));
    assert_eq!(b.nrows(), 2);
    let m = b.finish(2);
    assert!(m[0][1].is_nan());
    assert_eq!(m.get_at(1, 0), 3.0);
}
