use crate::reading::{FieldSlot, Reading};
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Upper bound on buckets per series; a tiny width over a long span is a
/// caller error rather than an allocation.
pub const MAX_BUCKETS: i64 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AggregateError {
    #[error("bucket width must be positive (got {0}ms)")]
    NonPositiveWidth(i64),
    #[error("{buckets} buckets exceeds the limit of {MAX_BUCKETS}")]
    TooManyBuckets { buckets: i64 },
}

/// Bucket content. `Gap` means no reading reported the slot inside the bucket;
/// it is never rendered as zero and never interpolated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BucketValue {
    Mean { value: f64, samples: u32 },
    Gap,
}

impl BucketValue {
    pub fn mean(&self) -> Option<f64> {
        match self {
            BucketValue::Mean { value, .. } => Some(*value),
            BucketValue::Gap => None,
        }
    }

    pub fn is_gap(&self) -> bool {
        matches!(self, BucketValue::Gap)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesPoint {
    pub start: DateTime<Utc>,
    #[serde(flatten)]
    pub value: BucketValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub slot: FieldSlot,
    pub bucket_width_seconds: i64,
    pub points: Vec<SeriesPoint>,
}

impl Series {
    pub fn gaps(&self) -> usize {
        self.points.iter().filter(|p| p.value.is_gap()).count()
    }

    pub fn latest_value(&self) -> Option<f64> {
        self.points.iter().rev().find_map(|p| p.value.mean())
    }
}

pub type SeriesMap = BTreeMap<FieldSlot, Series>;

/// Buckets `readings` into contiguous epoch-aligned windows of `bucket_width`
/// covering the earliest through the latest timestamp, one series per slot.
/// Input order does not affect the result.
pub fn aggregate(
    readings: &[Reading],
    bucket_width: ChronoDuration,
    field_slots: &[FieldSlot],
) -> Result<SeriesMap, AggregateError> {
    let width_ms = bucket_width.num_milliseconds();
    if width_ms <= 0 {
        return Err(AggregateError::NonPositiveWidth(width_ms));
    }

    let mut ordered: Vec<&Reading> = readings.iter().collect();
    ordered.sort_by(|a, b| compare_readings(a, b));

    let span = match (ordered.first(), ordered.last()) {
        (Some(first), Some(last)) => {
            let first_ms = align_down_ms(first.timestamp(), width_ms);
            let last_ms = align_down_ms(last.timestamp(), width_ms);
            let buckets = (last_ms - first_ms) / width_ms + 1;
            if buckets > MAX_BUCKETS {
                return Err(AggregateError::TooManyBuckets { buckets });
            }
            Some((first_ms, buckets as usize))
        }
        _ => None,
    };

    let mut out = SeriesMap::new();
    for &slot in field_slots {
        let points = match span {
            Some((first_ms, buckets)) => bucket_slot(&ordered, slot, first_ms, width_ms, buckets),
            None => Vec::new(),
        };
        out.insert(
            slot,
            Series {
                slot,
                bucket_width_seconds: bucket_width.num_seconds(),
                points,
            },
        );
    }
    Ok(out)
}

fn bucket_slot(
    ordered: &[&Reading],
    slot: FieldSlot,
    first_ms: i64,
    width_ms: i64,
    buckets: usize,
) -> Vec<SeriesPoint> {
    let mut sums = vec![(0.0f64, 0u32); buckets];
    for reading in ordered {
        let Some(value) = reading.get(slot) else {
            continue;
        };
        let idx = ((align_down_ms(reading.timestamp(), width_ms) - first_ms) / width_ms) as usize;
        let (sum, count) = &mut sums[idx];
        *sum += value;
        *count += 1;
    }

    sums.into_iter()
        .enumerate()
        .map(|(idx, (sum, count))| SeriesPoint {
            start: ms_to_dt(first_ms + idx as i64 * width_ms),
            value: if count == 0 {
                BucketValue::Gap
            } else {
                BucketValue::Mean {
                    value: sum / count as f64,
                    samples: count,
                }
            },
        })
        .collect()
}

// Total order over whole readings so summation order (and therefore every
// floating point mean) is independent of the input order.
fn compare_readings(a: &Reading, b: &Reading) -> Ordering {
    a.timestamp().cmp(&b.timestamp()).then_with(|| {
        FieldSlot::ALL
            .into_iter()
            .map(|slot| match (a.get(slot), b.get(slot)) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    })
}

fn align_down_ms(ts: DateTime<Utc>, width_ms: i64) -> i64 {
    ts.timestamp_millis().div_euclid(width_ms) * width_ms
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
