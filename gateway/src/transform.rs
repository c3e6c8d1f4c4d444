//! Serialization of metric results into JSON response bodies.
//!
//! Tables can be grouped (`group_by` + `aggregate`) or bucketed in time (`resample` over
//! `date_col`) before they are written out in one of several orientations. Anything else is
//! encoded as plain JSON; text that does not parse as JSON is passed through as an
//! [`Encoded::Opaque`] body.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{
    ser::{SerializeMap, SerializeSeq},
    Serialize, Serializer,
};

use crate::table::{Cell, MetricValue, Table};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid {name}: {value}")]
    InvalidOption { name: &'static str, value: String },

    #[error("unknown column: {0}")]
    MissingColumn(String),

    #[error("column {column} holds a value that is not a timestamp: {value}")]
    InvalidDate { column: String, value: String },

    #[error("resample would produce {buckets} buckets, more than the limit of {limit}")]
    TooManyBuckets { buckets: u64, limit: usize },
}

/// Default cap on the number of rows a resample may emit.
pub const DEFAULT_MAX_BUCKETS: usize = 100_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// JSON layout of a serialized table.
pub enum Orient {
    /// `[{column: value}, ...]`
    #[default]
    Records,
    /// `{"columns": [...], "index": [...], "data": [[...]]}`
    Split,
    /// `{"<row>": {column: value}}`
    Index,
    /// `{column: {"<row>": value}}`
    Columns,
    /// `[[...], ...]`
    Values,
}

impl FromStr for Orient {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "records" => Ok(Self::Records),
            "split" => Ok(Self::Split),
            "index" => Ok(Self::Index),
            "columns" => Ok(Self::Columns),
            "values" => Ok(Self::Values),
            other => Err(TransformError::InvalidOption {
                name: "orient",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Reduction applied to each group or time bucket.
pub enum Aggregate {
    #[default]
    Sum,
    Mean,
    Count,
    Min,
    Max,
    First,
    Last,
}

impl FromStr for Aggregate {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(Self::Sum),
            "mean" => Ok(Self::Mean),
            "count" => Ok(Self::Count),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => Err(TransformError::InvalidOption {
                name: "aggregate",
                value: other.to_string(),
            }),
        }
    }
}

impl Aggregate {
    /// Whether columns holding non-numeric values survive the reduction.
    fn keeps_non_numeric(self) -> bool {
        matches!(self, Self::Count | Self::First | Self::Last)
    }

    /// Reduce one column's cells. `float_column` keeps sums of float columns as floats even when
    /// every contributing cell is null.
    fn reduce<'a>(self, cells: impl Iterator<Item = &'a Cell>, float_column: bool) -> Cell {
        let mut present = cells.filter(|c| !c.is_null());
        match self {
            Self::Count => Cell::Int(present.count() as i64),
            Self::First => present.next().cloned().unwrap_or(Cell::Null),
            Self::Last => present.last().cloned().unwrap_or(Cell::Null),
            Self::Sum => {
                let mut int_sum = 0i64;
                let mut float_sum = 0f64;
                let mut any_float = false;
                for cell in present {
                    match cell {
                        Cell::Int(v) => int_sum = int_sum.saturating_add(*v),
                        Cell::Bool(v) => int_sum += i64::from(*v),
                        Cell::Float(v) => {
                            any_float = true;
                            float_sum += v;
                        }
                        _ => {}
                    }
                }
                if any_float || float_column {
                    Cell::Float(float_sum + int_sum as f64)
                } else {
                    Cell::Int(int_sum)
                }
            }
            Self::Mean => {
                let values: Vec<f64> = present.filter_map(Cell::as_f64).collect();
                if values.is_empty() {
                    Cell::Null
                } else {
                    Cell::Float(values.iter().sum::<f64>() / values.len() as f64)
                }
            }
            Self::Min | Self::Max => {
                let wanted = if self == Self::Min {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                present
                    .filter(|c| c.is_numeric())
                    .fold(None::<&Cell>, |best, c| match best {
                        Some(b) if c.sort_cmp(b) != wanted => Some(b),
                        _ => Some(c),
                    })
                    .cloned()
                    .unwrap_or(Cell::Null)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl Unit {
    fn code(self) -> &'static str {
        match self {
            Self::Second => "S",
            Self::Minute => "T",
            Self::Hour => "H",
            Self::Day => "D",
            Self::Week => "W",
            Self::Month => "M",
            Self::Quarter => "Q",
            Self::Year => "A",
        }
    }

    fn months(self) -> u32 {
        match self {
            Self::Quarter => 3,
            Self::Year => 12,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A pandas-style resample rule such as `D`, `2H`, `W` or `M`.
pub struct ResampleRule {
    count: u32,
    unit: Unit,
}

impl fmt::Display for ResampleRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.code())
    }
}

impl FromStr for ResampleRule {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransformError::InvalidOption {
            name: "resample",
            value: s.to_string(),
        };

        let trimmed = s.trim();
        let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
        let (count, unit) = trimmed.split_at(digits);
        let count = if count.is_empty() {
            1
        } else {
            count.parse::<u32>().map_err(|_| invalid())?
        };
        if count == 0 {
            return Err(invalid());
        }

        let unit = match unit {
            "S" | "s" => Unit::Second,
            "T" | "min" => Unit::Minute,
            "H" | "h" => Unit::Hour,
            "D" | "d" => Unit::Day,
            "W" | "W-SUN" => Unit::Week,
            "M" | "ME" => Unit::Month,
            "Q" | "QE" => Unit::Quarter,
            "A" | "Y" | "YE" => Unit::Year,
            _ => return Err(invalid()),
        };
        Ok(Self { count, unit })
    }
}

impl ResampleRule {
    fn fixed_step(self) -> Option<Duration> {
        let n = i64::from(self.count);
        match self.unit {
            Unit::Second => Some(Duration::seconds(n)),
            Unit::Minute => Some(Duration::minutes(n)),
            Unit::Hour => Some(Duration::hours(n)),
            Unit::Day => Some(Duration::days(n)),
            _ => None,
        }
    }
}

/// Last day of the calendar period (week ending Sunday, month, quarter, year) containing `date`.
/// `None` when the period end falls outside the representable date range.
fn period_end(unit: Unit, date: NaiveDate) -> Option<NaiveDate> {
    match unit {
        Unit::Week => {
            let to_sunday = 6 - date.weekday().num_days_from_monday();
            date.checked_add_days(Days::new(u64::from(to_sunday)))
        }
        Unit::Month => month_end(date.year(), date.month()),
        Unit::Quarter => month_end(date.year(), (date.month() - 1) / 3 * 3 + 3),
        _ => month_end(date.year(), 12),
    }
}

fn month_end(year: i32, month: u32) -> Option<NaiveDate> {
    if month == 12 {
        NaiveDate::from_ymd_opt(year, 12, 31)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?.pred_opt()
    }
}

/// Advance a period-end label by `k` periods.
fn advance_period(unit: Unit, label: NaiveDate, k: u32) -> Option<NaiveDate> {
    match unit {
        Unit::Week => label.checked_add_days(Days::new(7 * u64::from(k))),
        Unit::Month | Unit::Quarter | Unit::Year => {
            let months = k.checked_mul(unit.months())?;
            let first = NaiveDate::from_ymd_opt(label.year(), label.month(), 1)?
                .checked_add_months(Months::new(months))?;
            month_end(first.year(), first.month())
        }
        _ => Some(label),
    }
}

fn periods_between(unit: Unit, from: NaiveDate, to: NaiveDate) -> u32 {
    match unit {
        Unit::Week => u32::try_from((to - from).num_days() / 7).unwrap_or(0),
        _ => {
            let months = (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32;
            u32::try_from(months / unit.months() as i32).unwrap_or(0)
        }
    }
}

fn check_bucket_limit(buckets: u64, limit: usize) -> Result<(), TransformError> {
    if buckets > limit as u64 {
        return Err(TransformError::TooManyBuckets { buckets, limit });
    }
    Ok(())
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

#[derive(Debug, Clone, PartialEq)]
/// Options accepted by [`transform`], normally taken from the request query string.
pub struct TransformOptions {
    pub orient: Orient,
    pub group_by: Vec<String>,
    pub aggregate: Aggregate,
    pub resample: Option<ResampleRule>,
    pub date_col: String,
    /// Upper bound on resampled rows; larger results are rejected.
    pub max_buckets: usize,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            orient: Orient::default(),
            group_by: Vec::new(),
            aggregate: Aggregate::default(),
            resample: None,
            date_col: "date".to_string(),
            max_buckets: DEFAULT_MAX_BUCKETS,
        }
    }
}

impl TransformOptions {
    /// Read options from query parameters. Unrelated parameters are ignored; an empty value
    /// means "unset".
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self, TransformError> {
        let get = |name: &str| {
            query
                .get(name)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty() && *v != "null")
        };

        let mut opts = Self::default();
        if let Some(orient) = get("orient") {
            opts.orient = orient.parse()?;
        }
        if let Some(group_by) = get("group_by") {
            opts.group_by = group_by
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(aggregate) = get("aggregate") {
            opts.aggregate = aggregate.parse()?;
        }
        if let Some(resample) = get("resample") {
            opts.resample = Some(resample.parse()?);
        }
        if let Some(date_col) = get("date_col") {
            opts.date_col = date_col.to_string();
        }
        Ok(opts)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A serialized response body.
pub enum Encoded {
    /// Well-formed JSON.
    Json(String),
    /// Text that could not be encoded as JSON, passed through unchanged.
    Opaque(String),
}

impl Encoded {
    pub fn is_opaque(&self) -> bool {
        matches!(self, Self::Opaque(_))
    }

    pub fn into_string(self) -> String {
        match self {
            Self::Json(s) | Self::Opaque(s) => s,
        }
    }
}

/// Serialize a metric result, reducing tables first when the options ask for it.
pub fn transform(value: MetricValue, opts: &TransformOptions) -> Result<Encoded, TransformError> {
    match value {
        MetricValue::Table(mut table) => {
            if !opts.group_by.is_empty() {
                table = group_by(table, &opts.group_by, opts.aggregate)?;
            }
            if let Some(rule) = opts.resample {
                table = resample(table, opts, rule)?;
            }
            let out = encode_table(&table, opts.orient);
            Ok(out.map_or_else(|_| Encoded::Opaque(format!("{table:?}")), Encoded::Json))
        }
        MetricValue::Value(v) => Ok(serde_json::to_string(&v)
            .map_or_else(|_| Encoded::Opaque(v.to_string()), Encoded::Json)),
        MetricValue::Text(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(v) => Ok(serde_json::to_string(&v).map_or(Encoded::Opaque(text), Encoded::Json)),
            Err(_) => Ok(Encoded::Opaque(text)),
        },
    }
}

fn lookup_column(table: &Table, name: &str) -> Result<usize, TransformError> {
    table
        .column_index(name)
        .ok_or_else(|| TransformError::MissingColumn(name.to_string()))
}

fn is_float_column(table: &Table, idx: usize) -> bool {
    table.rows().iter().any(|row| matches!(row[idx], Cell::Float(_)))
}

/// Columns (by index) that survive `agg`, excluding `skip`.
fn value_columns(table: &Table, skip: &[usize], agg: Aggregate) -> Vec<usize> {
    (0..table.columns().len())
        .filter(|idx| !skip.contains(idx))
        .filter(|&idx| {
            agg.keeps_non_numeric()
                || table
                    .rows()
                    .iter()
                    .all(|row| row[idx].is_null() || row[idx].is_numeric())
        })
        .collect()
}

fn group_by(table: Table, keys: &[String], agg: Aggregate) -> Result<Table, TransformError> {
    let key_idx = keys
        .iter()
        .map(|k| lookup_column(&table, k))
        .collect::<Result<Vec<_>, _>>()?;
    let values = value_columns(&table, &key_idx, agg);

    let key_of = |row: &[Cell]| -> Vec<Cell> { key_idx.iter().map(|&i| row[i].clone()).collect() };
    let cmp_keys = |a: &[Cell], b: &[Cell]| {
        a.iter()
            .zip(b)
            .map(|(x, y)| x.sort_cmp(y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    };

    // Rows with a null key are dropped, like pandas' default `dropna=True`.
    let mut keyed: Vec<(Vec<Cell>, usize)> = table
        .rows()
        .iter()
        .enumerate()
        .map(|(i, row)| (key_of(row), i))
        .filter(|(k, _)| !k.iter().any(Cell::is_null))
        .collect();
    keyed.sort_by(|(a, _), (b, _)| cmp_keys(a, b));

    let mut columns: Vec<String> = key_idx.iter().map(|&i| table.columns()[i].clone()).collect();
    columns.extend(values.iter().map(|&i| table.columns()[i].clone()));

    let mut rows = Vec::new();
    let mut start = 0;
    while start < keyed.len() {
        let mut end = start + 1;
        while end < keyed.len() && cmp_keys(&keyed[start].0, &keyed[end].0) == Ordering::Equal {
            end += 1;
        }

        let members = &keyed[start..end];
        let mut row = members[0].0.clone();
        for &col in &values {
            row.push(agg.reduce(
                members.iter().map(|(_, r)| &table.rows()[*r][col]),
                is_float_column(&table, col),
            ));
        }
        rows.push(row);
        start = end;
    }

    Ok(Table::from_parts(columns, rows))
}

fn parse_timestamp(column: &str, cell: &Cell) -> Result<Option<DateTime<Utc>>, TransformError> {
    let invalid = || TransformError::InvalidDate {
        column: column.to_string(),
        value: serde_json::to_string(cell).unwrap_or_default(),
    };

    match cell {
        Cell::Null => Ok(None),
        Cell::Timestamp(ts) => Ok(Some(*ts)),
        Cell::Int(ms) => Utc.timestamp_millis_opt(*ms).single().map(Some).ok_or_else(invalid),
        Cell::Text(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok(Some(ts.with_timezone(&Utc)));
            }
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Ok(Some(Utc.from_utc_datetime(&naive)));
                }
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(|d| Some(midnight(d)))
                .map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

fn resample(
    table: Table,
    opts: &TransformOptions,
    rule: ResampleRule,
) -> Result<Table, TransformError> {
    let (date_col, agg) = (opts.date_col.as_str(), opts.aggregate);
    let out_of_range = || TransformError::InvalidOption {
        name: "resample",
        value: rule.to_string(),
    };

    let date_idx = lookup_column(&table, date_col)?;
    let mut skip = vec![date_idx];
    if let Some(existing) = table.column_index("date") {
        skip.push(existing);
    }
    let values = value_columns(&table, &skip, agg);

    let mut stamped = Vec::with_capacity(table.len());
    for (i, row) in table.rows().iter().enumerate() {
        if let Some(ts) = parse_timestamp(date_col, &row[date_idx])? {
            stamped.push((ts, i));
        }
    }

    let mut columns: Vec<String> = values.iter().map(|&i| table.columns()[i].clone()).collect();
    columns.push("date".to_string());

    let Some(first) = stamped.iter().map(|(ts, _)| *ts).min() else {
        return Ok(Table::from_parts(columns, Vec::new()));
    };

    // Bucket label for each row, plus the ordered list of every label in range. The label count
    // is checked against the limit before any label is materialized.
    let mut buckets: BTreeMap<DateTime<Utc>, Vec<usize>> = BTreeMap::new();
    let labels: Vec<DateTime<Utc>> = match rule.fixed_step() {
        Some(step) => {
            let origin = midnight(first.date_naive());
            let step_ms = step.num_milliseconds().max(1);
            for (ts, i) in &stamped {
                let offset = (*ts - origin).num_milliseconds().div_euclid(step_ms);
                let label = origin + Duration::milliseconds(offset * step_ms);
                buckets.entry(label).or_default().push(*i);
            }
            let lo = buckets.keys().next().copied().unwrap_or(origin);
            let hi = buckets.keys().next_back().copied().unwrap_or(lo);
            let count = (hi - lo).num_milliseconds() / step_ms + 1;
            check_bucket_limit(count.unsigned_abs(), opts.max_buckets)?;
            (0..count)
                .map(|n| lo.checked_add_signed(Duration::milliseconds(n * step_ms)))
                .collect::<Option<_>>()
                .ok_or_else(out_of_range)?
        }
        None => {
            let unit = rule.unit;
            let first_label = period_end(unit, first.date_naive()).ok_or_else(out_of_range)?;
            for (ts, i) in &stamped {
                let own = period_end(unit, ts.date_naive()).ok_or_else(out_of_range)?;
                let k = periods_between(unit, first_label, own);
                let grouped = k
                    .div_ceil(rule.count)
                    .checked_mul(rule.count)
                    .ok_or_else(out_of_range)?;
                let label = advance_period(unit, first_label, grouped).ok_or_else(out_of_range)?;
                buckets.entry(midnight(label)).or_default().push(*i);
            }
            let last = buckets
                .keys()
                .next_back()
                .map_or(first_label, |ts| ts.date_naive());
            let count = u64::from(periods_between(unit, first_label, last) / rule.count) + 1;
            check_bucket_limit(count, opts.max_buckets)?;
            (0..count)
                .map(|n| {
                    let k = u32::try_from(n).ok()?.checked_mul(rule.count)?;
                    advance_period(unit, first_label, k).map(midnight)
                })
                .collect::<Option<_>>()
                .ok_or_else(out_of_range)?
        }
    };

    let floats: Vec<bool> = values.iter().map(|&c| is_float_column(&table, c)).collect();
    let empty = Vec::new();
    let rows = labels
        .into_iter()
        .map(|label| {
            let members = buckets.get(&label).unwrap_or(&empty);
            let mut row: Vec<Cell> = values
                .iter()
                .zip(&floats)
                .map(|(&col, &float_column)| {
                    agg.reduce(members.iter().map(|&r| &table.rows()[r][col]), float_column)
                })
                .collect();
            row.push(Cell::Timestamp(label));
            row
        })
        .collect();

    Ok(Table::from_parts(columns, rows))
}

struct Record<'a> {
    columns: &'a [String],
    row: &'a [Cell],
}

impl Serialize for Record<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, cell) in self.columns.iter().zip(self.row) {
            map.serialize_entry(name, cell)?;
        }
        map.end()
    }
}

struct Column<'a> {
    rows: &'a [Vec<Cell>],
    idx: usize,
}

impl Serialize for Column<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.rows.len()))?;
        for (i, row) in self.rows.iter().enumerate() {
            map.serialize_entry(&i.to_string(), &row[self.idx])?;
        }
        map.end()
    }
}

struct Oriented<'a> {
    table: &'a Table,
    orient: Orient,
}

impl Serialize for Oriented<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let columns = self.table.columns();
        let rows = self.table.rows();
        match self.orient {
            Orient::Records => {
                let mut seq = serializer.serialize_seq(Some(rows.len()))?;
                for row in rows {
                    seq.serialize_element(&Record { columns, row })?;
                }
                seq.end()
            }
            Orient::Values => rows.serialize(serializer),
            Orient::Index => {
                let mut map = serializer.serialize_map(Some(rows.len()))?;
                for (i, row) in rows.iter().enumerate() {
                    map.serialize_entry(&i.to_string(), &Record { columns, row })?;
                }
                map.end()
            }
            Orient::Columns => {
                let mut map = serializer.serialize_map(Some(columns.len()))?;
                for (idx, name) in columns.iter().enumerate() {
                    map.serialize_entry(name, &Column { rows, idx })?;
                }
                map.end()
            }
            Orient::Split => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("columns", columns)?;
                map.serialize_entry("index", &(0..rows.len()).collect::<Vec<_>>())?;
                map.serialize_entry("data", rows)?;
                map.end()
            }
        }
    }
}

fn encode_table(table: &Table, orient: Orient) -> serde_json::Result<String> {
    serde_json::to_string(&Oriented { table, orient })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn commits() -> Table {
        Table::new(["date", "author", "commits", "additions"])
            .with_row(vec!["2019-01-01".into(), "ann".into(), 2_i64.into(), 1.5.into()])
            .with_row(vec!["2019-01-01".into(), "bob".into(), 1_i64.into(), 0.5.into()])
            .with_row(vec!["2019-01-03".into(), "ann".into(), 4_i64.into(), Cell::Null])
    }

    fn run(value: MetricValue, opts: &TransformOptions) -> Value {
        let out = transform(value, opts).unwrap();
        assert!(!out.is_opaque());
        serde_json::from_str(&out.into_string()).unwrap()
    }

    #[test]
    fn records_orientation_is_the_default() {
        let out = run(commits().into(), &TransformOptions::default());
        assert_eq!(out.as_array().unwrap().len(), 3);
        assert_eq!(
            out[0],
            json!({"date": "2019-01-01", "author": "ann", "commits": 2, "additions": 1.5})
        );
    }

    #[test]
    fn records_keep_column_order() {
        let out = transform(commits().into(), &TransformOptions::default())
            .unwrap()
            .into_string();
        assert!(out.starts_with(r#"[{"date":"2019-01-01","author":"ann""#));
    }

    #[test]
    fn other_orientations() {
        let table = Table::new(["a", "b"])
            .with_row(vec![1_i64.into(), "x".into()])
            .with_row(vec![2_i64.into(), "y".into()]);

        let opts = |orient| TransformOptions {
            orient,
            ..Default::default()
        };

        assert_eq!(
            run(table.clone().into(), &opts(Orient::Split)),
            json!({"columns": ["a", "b"], "index": [0, 1], "data": [[1, "x"], [2, "y"]]})
        );
        assert_eq!(
            run(table.clone().into(), &opts(Orient::Index)),
            json!({"0": {"a": 1, "b": "x"}, "1": {"a": 2, "b": "y"}})
        );
        assert_eq!(
            run(table.clone().into(), &opts(Orient::Columns)),
            json!({"a": {"0": 1, "1": 2}, "b": {"0": "x", "1": "y"}})
        );
        assert_eq!(
            run(table.into(), &opts(Orient::Values)),
            json!([[1, "x"], [2, "y"]])
        );
    }

    #[test]
    fn group_by_sums_numeric_columns_per_key() {
        let opts = TransformOptions {
            group_by: vec!["author".into()],
            ..Default::default()
        };
        let out = run(commits().into(), &opts);
        assert_eq!(
            out,
            json!([
                {"author": "ann", "commits": 6, "additions": 1.5},
                {"author": "bob", "commits": 1, "additions": 0.5},
            ])
        );
    }

    #[test]
    fn group_by_count_keeps_text_columns() {
        let opts = TransformOptions {
            group_by: vec!["author".into()],
            aggregate: Aggregate::Count,
            ..Default::default()
        };
        let out = run(commits().into(), &opts);
        assert_eq!(
            out[0],
            json!({"author": "ann", "date": 2, "commits": 2, "additions": 1})
        );
    }

    #[test]
    fn group_by_unknown_column_is_an_error() {
        let opts = TransformOptions {
            group_by: vec!["nope".into()],
            ..Default::default()
        };
        assert!(matches!(
            transform(commits().into(), &opts),
            Err(TransformError::MissingColumn(c)) if c == "nope"
        ));
    }

    #[test]
    fn daily_resample_fills_gaps_and_reattaches_date() {
        let opts = TransformOptions {
            resample: Some("D".parse().unwrap()),
            ..Default::default()
        };
        let out = run(commits().into(), &opts);
        assert_eq!(
            out,
            json!([
                {"commits": 3, "additions": 2.0, "date": "2019-01-01T00:00:00.000Z"},
                {"commits": 0, "additions": 0.0, "date": "2019-01-02T00:00:00.000Z"},
                {"commits": 4, "additions": 0.0, "date": "2019-01-03T00:00:00.000Z"},
            ])
        );
    }

    #[test]
    fn mean_of_empty_bucket_is_null() {
        let opts = TransformOptions {
            resample: Some("D".parse().unwrap()),
            aggregate: Aggregate::Mean,
            ..Default::default()
        };
        let out = run(commits().into(), &opts);
        assert_eq!(out[0]["commits"], json!(1.5));
        assert!(out[1]["commits"].is_null());
    }

    #[test]
    fn weekly_resample_labels_with_sunday() {
        // 2019-01-01 is a Tuesday; the week ends Sunday 2019-01-06.
        let table = Table::new(["when", "n"])
            .with_row(vec!["2019-01-01T10:00:00Z".into(), 1_i64.into()])
            .with_row(vec!["2019-01-06T23:00:00Z".into(), 1_i64.into()])
            .with_row(vec!["2019-01-07T00:00:00Z".into(), 5_i64.into()]);
        let opts = TransformOptions {
            resample: Some("W".parse().unwrap()),
            date_col: "when".into(),
            ..Default::default()
        };
        let out = run(table.into(), &opts);
        assert_eq!(
            out,
            json!([
                {"n": 2, "date": "2019-01-06T00:00:00.000Z"},
                {"n": 5, "date": "2019-01-13T00:00:00.000Z"},
            ])
        );
    }

    #[test]
    fn monthly_resample_labels_with_month_end() {
        let table = Table::new(["date", "n"])
            .with_row(vec!["2019-01-15".into(), 1_i64.into()])
            .with_row(vec!["2019-03-02".into(), 2_i64.into()]);
        let opts = TransformOptions {
            resample: Some("M".parse().unwrap()),
            ..Default::default()
        };
        let out = run(table.into(), &opts);
        let dates: Vec<&str> = out
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["date"].as_str().unwrap())
            .collect();
        assert_eq!(
            dates,
            vec![
                "2019-01-31T00:00:00.000Z",
                "2019-02-28T00:00:00.000Z",
                "2019-03-31T00:00:00.000Z"
            ]
        );
        assert_eq!(out[1]["n"], 0);
    }

    #[test]
    fn unparseable_dates_fail_the_transform() {
        let table = Table::new(["date", "n"]).with_row(vec!["yesterday".into(), 1_i64.into()]);
        let opts = TransformOptions {
            resample: Some("D".parse().unwrap()),
            ..Default::default()
        };
        assert!(matches!(
            transform(table.into(), &opts),
            Err(TransformError::InvalidDate { .. })
        ));
    }

    fn two_years() -> Table {
        Table::new(["date", "n"])
            .with_row(vec!["2018-03-01".into(), 1_i64.into()])
            .with_row(vec!["2019-06-15".into(), 2_i64.into()])
    }

    fn resampled(rule: &str, max_buckets: usize) -> Result<Encoded, TransformError> {
        let opts = TransformOptions {
            resample: Some(rule.parse().unwrap()),
            aggregate: Aggregate::Sum,
            max_buckets,
            ..Default::default()
        };
        transform(two_years().into(), &opts)
    }

    #[test]
    fn huge_fixed_step_collapses_to_one_bucket() {
        let out = resampled("100000000D", DEFAULT_MAX_BUCKETS).unwrap();
        let rows: Value = serde_json::from_str(&out.into_string()).unwrap();
        assert_eq!(rows, json!([{"n": 3, "date": "2018-03-01T00:00:00.000Z"}]));
    }

    #[test]
    fn calendar_step_past_the_date_range_is_rejected() {
        assert!(matches!(
            resampled("300000A", DEFAULT_MAX_BUCKETS),
            Err(TransformError::InvalidOption { name: "resample", .. })
        ));
        assert!(matches!(
            resampled("4294967295M", DEFAULT_MAX_BUCKETS),
            Err(TransformError::InvalidOption { name: "resample", .. })
        ));
    }

    #[test]
    fn bucket_count_is_capped_before_allocating() {
        let err = resampled("S", DEFAULT_MAX_BUCKETS).unwrap_err();
        assert!(matches!(
            err,
            TransformError::TooManyBuckets { limit: DEFAULT_MAX_BUCKETS, .. }
        ));
        // 16 month ends from March 2018 to June 2019.
        assert!(matches!(
            resampled("M", 15),
            Err(TransformError::TooManyBuckets { buckets: 16, limit: 15 })
        ));
        assert!(resampled("M", 16).is_ok());
    }

    #[test]
    fn resample_rules_parse() {
        assert!("2H".parse::<ResampleRule>().is_ok());
        assert!("15min".parse::<ResampleRule>().is_ok());
        assert!("0D".parse::<ResampleRule>().is_err());
        assert!("fortnight".parse::<ResampleRule>().is_err());
    }

    #[test]
    fn options_come_from_query_parameters() {
        let query = HashMap::from([
            ("orient".to_string(), "split".to_string()),
            ("group_by".to_string(), "author, repo".to_string()),
            ("aggregate".to_string(), "mean".to_string()),
            ("unrelated".to_string(), "1".to_string()),
        ]);
        let opts = TransformOptions::from_query(&query).unwrap();
        assert_eq!(opts.orient, Orient::Split);
        assert_eq!(opts.group_by, vec!["author", "repo"]);
        assert_eq!(opts.aggregate, Aggregate::Mean);
        assert_eq!(opts.date_col, "date");
        assert!(opts.resample.is_none());

        let bad = HashMap::from([("orient".to_string(), "sideways".to_string())]);
        assert!(TransformOptions::from_query(&bad).is_err());
    }

    #[test]
    fn null_orient_falls_back_to_records() {
        let query = HashMap::from([("orient".to_string(), "null".to_string())]);
        assert_eq!(
            TransformOptions::from_query(&query).unwrap().orient,
            Orient::Records
        );
    }

    #[test]
    fn plain_values_are_json_encoded() {
        let out = run(json!({"status": "OK", "n": [1, 2]}).into(), &Default::default());
        assert_eq!(out, json!({"status": "OK", "n": [1, 2]}));
    }

    #[test]
    fn serialized_json_text_round_trips() {
        let input = r#"{"a": [1, 2, {"b": null}], "c": "d"}"#;
        let out = run(MetricValue::Text(input.into()), &Default::default());
        let direct: Value = serde_json::from_str(input).unwrap();
        assert_eq!(out, direct);
    }

    #[test]
    fn non_json_text_becomes_opaque() {
        let out = transform(MetricValue::Text("not json".into()), &Default::default()).unwrap();
        assert_eq!(out, Encoded::Opaque("not json".into()));
    }
}
