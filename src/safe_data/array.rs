use super::{json_f64, option_json, DataError};
use serde_json::{json, Value};

/// Ordered sequence of numbers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafeArray {
    values: Vec<f64>,
}

impl SafeArray {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    /// Accepts a JSON array of numbers only; booleans are rejected.
    pub fn from_json(value: &Value) -> Result<Self, DataError> {
        let items = value.as_array().ok_or(DataError::NotAnArray)?;
        let values = items
            .iter()
            .enumerate()
            .map(|(index, item)| item.as_f64().ok_or(DataError::NotANumber { index }))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.sum() / self.values.len() as f64)
    }

    /// `ddof` 0 is the population variance, 1 the sample variance. `None`
    /// when there are not more than `ddof` values.
    pub fn variance(&self, ddof: usize) -> Option<f64> {
        let n = self.values.len();
        if n <= ddof {
            return None;
        }
        let mean = self.sum() / n as f64;
        let squares: f64 = self.values.iter().map(|x| (x - mean).powi(2)).sum();
        Some(squares / (n - ddof) as f64)
    }

    pub fn std(&self, ddof: usize) -> Option<f64> {
        self.variance(ddof).map(f64::sqrt)
    }

    pub fn min(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().reduce(f64::max)
    }

    /// Linear interpolation between closest ranks; `p` in `[0, 100]`.
    pub fn percentile(&self, p: f64) -> Result<Option<f64>, DataError> {
        if !(0.0..=100.0).contains(&p) {
            return Err(DataError::InvalidPercentile(p));
        }
        if self.values.is_empty() {
            return Ok(None);
        }
        let mut ordered = self.values.clone();
        ordered.sort_by(f64::total_cmp);
        let rank = (ordered.len() - 1) as f64 * (p / 100.0);
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        if lower == upper {
            return Ok(Some(ordered[lower]));
        }
        let weight = rank - lower as f64;
        Ok(Some(ordered[lower] + (ordered[upper] - ordered[lower]) * weight))
    }

    pub fn median(&self) -> Option<f64> {
        self.percentile(50.0).ok().flatten()
    }

    pub fn cumsum(&self) -> SafeArray {
        let mut total = 0.0;
        let values = self
            .values
            .iter()
            .map(|x| {
                total += x;
                total
            })
            .collect();
        SafeArray { values }
    }

    pub fn filter<F>(&self, predicate: F) -> SafeArray
    where
        F: Fn(f64) -> bool,
    {
        SafeArray {
            values: self.values.iter().copied().filter(|x| predicate(*x)).collect(),
        }
    }

    pub fn map<F>(&self, f: F) -> SafeArray
    where
        F: Fn(f64) -> f64,
    {
        SafeArray {
            values: self.values.iter().copied().map(f).collect(),
        }
    }

    pub fn sorted(&self, descending: bool) -> SafeArray {
        let mut values = self.values.clone();
        values.sort_by(f64::total_cmp);
        if descending {
            values.reverse();
        }
        SafeArray { values }
    }

    /// Summary statistics, keyed as the in-sandbox `describe()`.
    pub fn describe(&self) -> Value {
        let pct = |p: f64| option_json(self.percentile(p).ok().flatten());
        json!({
            "count": self.values.len(),
            "mean": option_json(self.mean()),
            "std": option_json(self.std(0)),
            "min": option_json(self.min()),
            "p25": pct(25.0),
            "median": pct(50.0),
            "p75": pct(75.0),
            "max": option_json(self.max()),
        })
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.values.iter().copied().map(json_f64).collect())
    }
}

impl From<Vec<f64>> for SafeArray {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}
