use super::{DataError, SafeArray, Scalar};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub type Row = BTreeMap<String, Scalar>;

/// Row predicate operators shared with the in-sandbox `SafeTable.where`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Contains,
    In,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Eq => "eq",
            Comparison::Ne => "ne",
            Comparison::Gt => "gt",
            Comparison::Ge => "ge",
            Comparison::Lt => "lt",
            Comparison::Le => "le",
            Comparison::Contains => "contains",
            Comparison::In => "in",
        }
    }

    /// Missing cells compare as null. Ordering operators only hold between
    /// two numbers or two texts.
    pub fn matches(&self, cell: &Scalar, operand: &Value) -> bool {
        let scalar = Scalar::from_json(operand);
        match self {
            Comparison::Eq => scalar.is_some_and(|s| cell.same_value(&s)),
            Comparison::Ne => !scalar.is_some_and(|s| cell.same_value(&s)),
            Comparison::Contains => match (cell, operand) {
                (Scalar::Text(haystack), Value::String(needle)) => {
                    haystack.contains(needle.as_str())
                }
                _ => false,
            },
            Comparison::In => operand.as_array().is_some_and(|items| {
                items
                    .iter()
                    .filter_map(Scalar::from_json)
                    .any(|item| cell.same_value(&item))
            }),
            Comparison::Gt | Comparison::Ge | Comparison::Lt | Comparison::Le => {
                let Some(ordering) = scalar.and_then(|s| cell.partial_order(&s)) else {
                    return false;
                };
                match self {
                    Comparison::Gt => ordering.is_gt(),
                    Comparison::Ge => ordering.is_ge(),
                    Comparison::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    Median,
    Std,
    Distinct,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Median => "median",
            AggFunc::Std => "std",
            AggFunc::Distinct => "distinct",
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One output column of [`SafeTable::aggregate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    /// `None` only for `count`, which then counts rows.
    #[serde(default)]
    pub column: Option<String>,
    pub func: AggFunc,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Aggregation {
    pub fn new(column: impl Into<String>, func: AggFunc) -> Self {
        Self {
            column: Some(column.into()),
            func,
            alias: None,
        }
    }

    pub fn count_rows() -> Self {
        Self {
            column: None,
            func: AggFunc::Count,
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// `alias`, else `func_column`, else `func`.
    pub fn output_name(&self) -> String {
        match (&self.alias, &self.column) {
            (Some(alias), _) => alias.clone(),
            (None, Some(column)) => format!("{}_{}", self.func, column),
            (None, None) => self.func.to_string(),
        }
    }

    pub fn check(&self) -> Result<(), DataError> {
        if self.column.is_none() && self.func != AggFunc::Count {
            return Err(DataError::MissingColumn(self.func));
        }
        Ok(())
    }

    fn apply(&self, table: &SafeTable) -> Scalar {
        let Some(column) = self.column.as_deref() else {
            return Scalar::Int(table.len() as i64);
        };
        let float = |v: Option<f64>| v.map(Scalar::Float).unwrap_or(Scalar::Null);
        match self.func {
            AggFunc::Count => Scalar::Int(
                table
                    .values(column)
                    .iter()
                    .filter(|v| !v.is_null())
                    .count() as i64,
            ),
            AggFunc::Distinct => {
                let mut seen: Vec<Scalar> = Vec::new();
                for value in table.values(column) {
                    if !value.is_null() && !seen.iter().any(|s| s.same_value(&value)) {
                        seen.push(value);
                    }
                }
                Scalar::Int(seen.len() as i64)
            }
            AggFunc::Sum => Scalar::Float(table.column(column).sum()),
            AggFunc::Mean => float(table.column(column).mean()),
            AggFunc::Min => float(table.column(column).min()),
            AggFunc::Max => float(table.column(column).max()),
            AggFunc::Median => float(table.column(column).median()),
            AggFunc::Std => float(table.column(column).std(0)),
        }
    }
}

/// Ordered sequence of rows mapping column name to scalar.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafeTable {
    rows: Vec<Row>,
}

impl SafeTable {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Accepts a JSON array of objects whose values are all scalars.
    pub fn from_json(value: &Value) -> Result<Self, DataError> {
        let items = value.as_array().ok_or(DataError::NotATable)?;
        let mut rows = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let object = item.as_object().ok_or(DataError::NotARow { index })?;
            let mut row = Row::new();
            for (column, cell) in object {
                let scalar = Scalar::from_json(cell).ok_or_else(|| DataError::NotAScalar {
                    row: index,
                    column: column.clone(),
                })?;
                row.insert(column.clone(), scalar);
            }
            rows.push(row);
        }
        Ok(Self { rows })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in order of first appearance.
    pub fn columns(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if !seen.contains(key) {
                    seen.push(key.clone());
                }
            }
        }
        seen
    }

    fn cell<'a>(row: &'a Row, column: &str) -> &'a Scalar {
        row.get(column).unwrap_or(&Scalar::Null)
    }

    pub fn filter<F>(&self, predicate: F) -> SafeTable
    where
        F: Fn(&Row) -> bool,
    {
        SafeTable {
            rows: self.rows.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    pub fn filter_where(&self, column: &str, op: Comparison, operand: &Value) -> SafeTable {
        self.filter(|row| op.matches(Self::cell(row, column), operand))
    }

    /// Missing columns come back as null.
    pub fn select<S: AsRef<str>>(&self, columns: &[S]) -> SafeTable {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| {
                        let c = c.as_ref();
                        (c.to_string(), Self::cell(row, c).clone())
                    })
                    .collect()
            })
            .collect();
        SafeTable { rows }
    }

    /// Stable sort; rows with a null or missing cell go last in either
    /// direction.
    pub fn sort_by(&self, column: &str, descending: bool) -> SafeTable {
        let (mut present, missing): (Vec<Row>, Vec<Row>) = self
            .rows
            .iter()
            .cloned()
            .partition(|row| !Self::cell(row, column).is_null());
        present.sort_by(|a, b| {
            let ordering = Self::cell(a, column).sort_cmp(Self::cell(b, column));
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        present.extend(missing);
        SafeTable { rows: present }
    }

    pub fn limit(&self, n: usize) -> SafeTable {
        SafeTable {
            rows: self.rows.iter().take(n).cloned().collect(),
        }
    }

    /// Numeric cells of `name`; other cells are skipped.
    pub fn column(&self, name: &str) -> SafeArray {
        SafeArray::new(
            self.rows
                .iter()
                .filter_map(|row| Self::cell(row, name).as_f64())
                .collect(),
        )
    }

    pub fn values(&self, name: &str) -> Vec<Scalar> {
        self.rows
            .iter()
            .map(|row| Self::cell(row, name).clone())
            .collect()
    }

    /// Groups in order of first appearance of their key.
    pub fn group_by(&self, column: &str) -> Vec<(Scalar, SafeTable)> {
        let mut groups: Vec<(Scalar, SafeTable)> = Vec::new();
        for row in &self.rows {
            let key = Self::cell(row, column);
            match groups.iter_mut().find(|(k, _)| k.same_value(key)) {
                Some((_, table)) => table.rows.push(row.clone()),
                None => groups.push((
                    key.clone(),
                    SafeTable {
                        rows: vec![row.clone()],
                    },
                )),
            }
        }
        groups
    }

    /// One output row per group (or a single row without `by`), holding the
    /// group key under `by` and one column per aggregation.
    pub fn aggregate(
        &self,
        aggregations: &[Aggregation],
        by: Option<&str>,
    ) -> Result<SafeTable, DataError> {
        for aggregation in aggregations {
            aggregation.check()?;
        }
        let groups = match by {
            Some(column) => self.group_by(column),
            None => vec![(Scalar::Null, self.clone())],
        };
        let rows = groups
            .into_iter()
            .map(|(key, table)| {
                let mut row = Row::new();
                if let Some(column) = by {
                    row.insert(column.to_string(), key);
                }
                for aggregation in aggregations {
                    row.insert(aggregation.output_name(), aggregation.apply(&table));
                }
                row
            })
            .collect();
        Ok(SafeTable { rows })
    }

    pub fn to_json(&self) -> Value {
        Value::Array(
            self.rows
                .iter()
                .map(|row| {
                    Value::Object(
                        row.iter()
                            .map(|(k, v)| (k.clone(), v.to_json()))
                            .collect::<Map<String, Value>>(),
                    )
                })
                .collect(),
        )
    }
}
