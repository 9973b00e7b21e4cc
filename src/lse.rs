/// Precomputed values of `ln(1 + exp(d))` for `d` in `[min_value, 0]`.
///
/// `log_sum_exp(a, b) = max(a, b) + ln(1 + exp(-|a - b|))`; the second term
/// is read from the table (linear interpolation between grid points). For
/// `d < min_value` the correction is computed directly. The table is built
/// once and passed by reference to every E-step computation.
#[derive(Debug, Clone)]
pub struct LogSumExpTable {
    min_value: f64,
    /// number of grid points per unit of `d`
    scale: f64,
    table: Vec<f64>,
}

impl LogSumExpTable {
    pub fn new(size: usize, min_value: f64) -> Self {
        let size = size.max(2);
        let min_value = if min_value < 0.0 { min_value } else { -1.0 };
        let scale = (size - 1) as f64 / -min_value;
        let table = (0..size)
            .map(|i| {
                let d = -(i as f64) / scale;
                d.exp().ln_1p()
            })
            .collect();
        Self {
            min_value,
            scale,
            table,
        }
    }

    pub fn size(&self) -> usize {
        self.table.len()
    }

    pub fn min_value(&self) -> f64 {
        self.min_value
    }

    /// `ln(1 + exp(d))` for `d <= 0`
    #[inline]
    pub fn ln_one_plus_exp(&self, d: f64) -> f64 {
        if d >= self.min_value {
            let x = -d * self.scale;
            let i = x as usize;
            if i + 1 >= self.table.len() {
                return self.table[self.table.len() - 1];
            }
            let frac = x - i as f64;
            self.table[i] + frac * (self.table[i + 1] - self.table[i])
        } else {
            d.exp().ln_1p()
        }
    }

    /// `ln(exp(a) + exp(b))`, `-inf` aware
    #[inline]
    pub fn log_sum_exp(&self, a: f64, b: f64) -> f64 {
        let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
        if lo == f64::NEG_INFINITY {
            return hi;
        }
        hi + self.ln_one_plus_exp(lo - hi)
    }

    /// `ln(sum_i exp(x_i))`
    pub fn log_sum_exp_iter(&self, it: impl IntoIterator<Item = f64>) -> f64 {
        it.into_iter()
            .fold(f64::NEG_INFINITY, |acc, x| self.log_sum_exp(acc, x))
    }
}

impl Default for LogSumExpTable {
    fn default() -> Self {
        Self::new(600000, -2000.0)
    }
}

/// `ln(x)` with `ln(0) = -inf` and negative input treated as zero
#[inline]
pub fn safe_ln(x: f64) -> f64 {
    if x > 0.0 {
        x.ln()
    } else {
        f64::NEG_INFINITY
    }
}

/// `exp(x)` for log values, mapping NaN to zero
#[inline]
pub fn safe_exp(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.exp()
    }
}

#[test]
fn test_log_sum_exp_table_accuracy() {
    let lookup = LogSumExpTable::default();
    for (a, b) in [
        (0.0, 0.0),
        (-1.0, -3.5),
        (-700.0, -701.2),
        (-10.0, -2500.0),
        (3.0, -1999.9),
        (-0.123456, -0.123457),
    ] {
        let direct = {
            let m = f64::max(a, b);
            m + ((a - m).exp() + (b - m).exp()).ln()
        };
        let table = lookup.log_sum_exp(a, b);
        assert!(
            (direct - table).abs() < 1e-6,
            "a={a} b={b} direct={direct} table={table}"
        );
        // symmetric
        assert_eq!(table, lookup.log_sum_exp(b, a));
    }
}

#[test]
fn test_log_sum_exp_small_table() {
    // small tables are still exact at the grid points
    let lookup = LogSumExpTable::new(11, -10.0);
    assert_eq!(lookup.size(), 11);
    assert!((lookup.ln_one_plus_exp(0.0) - 2f64.ln()).abs() < 1e-12);
    assert!((lookup.ln_one_plus_exp(-3.0) - (-3f64).exp().ln_1p()).abs() < 1e-12);
    // outside the table domain the value is computed directly
    assert_eq!(lookup.ln_one_plus_exp(-20.0), (-20f64).exp().ln_1p());
}

#[test]
fn test_log_sum_exp_neg_infinity() {
    let lookup = LogSumExpTable::new(1000, -50.0);
    let ninf = f64::NEG_INFINITY;
    assert_eq!(lookup.log_sum_exp(ninf, ninf), ninf);
    assert_eq!(lookup.log_sum_exp(ninf, -2.0), -2.0);
    assert_eq!(lookup.log_sum_exp(-2.0, ninf), -2.0);
    let total = lookup.log_sum_exp_iter([0.5f64.ln(), 0.25f64.ln(), 0.25f64.ln()]);
    assert!(total.abs() < 5e-4);
    assert_eq!(safe_ln(0.0), ninf);
    assert_eq!(safe_exp(f64::NAN), 0.0);
}
