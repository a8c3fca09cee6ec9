use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;

pub const FIELD_SLOT_COUNT: usize = 4;

/// One fixed numeric column of the channel. Slot numbering is part of the
/// deployment contract and is never reassigned at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSlot {
    Temperature,
    Humidity,
    Pressure,
    AirQuality,
}

impl FieldSlot {
    pub const ALL: [FieldSlot; FIELD_SLOT_COUNT] = [
        FieldSlot::Temperature,
        FieldSlot::Humidity,
        FieldSlot::Pressure,
        FieldSlot::AirQuality,
    ];

    pub fn ordinal(self) -> u8 {
        self.index() as u8 + 1
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            1 => Some(FieldSlot::Temperature),
            2 => Some(FieldSlot::Humidity),
            3 => Some(FieldSlot::Pressure),
            4 => Some(FieldSlot::AirQuality),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldSlot::Temperature => "temperature",
            FieldSlot::Humidity => "humidity",
            FieldSlot::Pressure => "pressure",
            FieldSlot::AirQuality => "air_quality",
        }
    }

    pub fn from_name(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");
        FieldSlot::ALL
            .into_iter()
            .find(|slot| slot.name() == normalized)
    }

    /// Store-side key for this slot (`field1`..`field4`).
    pub fn field_key(self) -> &'static str {
        match self {
            FieldSlot::Temperature => "field1",
            FieldSlot::Humidity => "field2",
            FieldSlot::Pressure => "field3",
            FieldSlot::AirQuality => "field4",
        }
    }

    pub fn from_field_key(raw: &str) -> Option<Self> {
        let ordinal = raw.trim().strip_prefix("field")?.parse::<u8>().ok()?;
        FieldSlot::from_ordinal(ordinal)
    }

    fn index(self) -> usize {
        match self {
            FieldSlot::Temperature => 0,
            FieldSlot::Humidity => 1,
            FieldSlot::Pressure => 2,
            FieldSlot::AirQuality => 3,
        }
    }
}

impl fmt::Display for FieldSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReadingError {
    #[error("{slot} value {value} is not finite")]
    NonFinite { slot: FieldSlot, value: f64 },
    #[error("malformed field map entry {0:?} (expected fieldN=name)")]
    MalformedMapEntry(String),
    #[error("unknown field key {0:?}")]
    UnknownFieldKey(String),
    #[error("{key} is fixed to {expected} for this deployment, not {found:?}")]
    SlotReassigned {
        key: String,
        expected: FieldSlot,
        found: String,
    },
    #[error("{0} listed more than once in field map")]
    DuplicateSlot(FieldSlot),
    #[error("{0} given more than once in one reading")]
    DuplicateValue(FieldSlot),
    #[error("field map lists no slots")]
    EmptyFieldMap,
}

/// One sensor sample. Immutable once built; absent slots stay `None` at every
/// layer so "not reported" never collapses into zero.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    timestamp: DateTime<Utc>,
    fields: [Option<f64>; FIELD_SLOT_COUNT],
}

impl Reading {
    /// Stamps the reading with the current clock.
    pub fn new(fields: impl IntoIterator<Item = (FieldSlot, f64)>) -> Result<Self, ReadingError> {
        Self::at(Utc::now(), fields)
    }

    pub fn at(
        timestamp: DateTime<Utc>,
        fields: impl IntoIterator<Item = (FieldSlot, f64)>,
    ) -> Result<Self, ReadingError> {
        let mut slots = [None; FIELD_SLOT_COUNT];
        for (slot, value) in fields {
            if !value.is_finite() {
                return Err(ReadingError::NonFinite { slot, value });
            }
            if slots[slot.index()].replace(value).is_some() {
                return Err(ReadingError::DuplicateValue(slot));
            }
        }
        Ok(Self {
            timestamp,
            fields: slots,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn get(&self, slot: FieldSlot) -> Option<f64> {
        self.fields[slot.index()]
    }

    pub fn populated(&self) -> impl Iterator<Item = (FieldSlot, f64)> + '_ {
        FieldSlot::ALL
            .into_iter()
            .filter_map(|slot| self.get(slot).map(|value| (slot, value)))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.iter().all(Option::is_none)
    }

    /// Same reading with every slot outside `map` dropped.
    pub fn restricted_to(&self, map: &FieldMap) -> Reading {
        let mut fields = self.fields;
        for slot in FieldSlot::ALL {
            if !map.contains(slot) {
                fields[slot.index()] = None;
            }
        }
        Reading {
            timestamp: self.timestamp,
            fields,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.timestamp.to_rfc3339())?;
        for (slot, value) in self.populated() {
            write!(f, " {slot}={value}")?;
        }
        Ok(())
    }
}

impl Serialize for Reading {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(FIELD_SLOT_COUNT + 1))?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        for slot in FieldSlot::ALL {
            map.serialize_entry(slot.name(), &self.get(slot))?;
        }
        map.end()
    }
}

/// The slots a deployment reports, in slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMap {
    slots: Vec<FieldSlot>,
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            slots: FieldSlot::ALL.to_vec(),
        }
    }
}

impl FieldMap {
    /// Parses `field1=temperature,field2=humidity,...`. Every entry must agree
    /// with the fixed slot assignment; a reassignment is a configuration error.
    pub fn parse(raw: &str) -> Result<Self, ReadingError> {
        let mut slots: Vec<FieldSlot> = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, name) = entry
                .split_once('=')
                .ok_or_else(|| ReadingError::MalformedMapEntry(entry.to_string()))?;
            let slot = FieldSlot::from_field_key(key)
                .ok_or_else(|| ReadingError::UnknownFieldKey(key.trim().to_string()))?;
            if FieldSlot::from_name(name) != Some(slot) {
                return Err(ReadingError::SlotReassigned {
                    key: key.trim().to_string(),
                    expected: slot,
                    found: name.trim().to_string(),
                });
            }
            if slots.contains(&slot) {
                return Err(ReadingError::DuplicateSlot(slot));
            }
            slots.push(slot);
        }
        if slots.is_empty() {
            return Err(ReadingError::EmptyFieldMap);
        }
        slots.sort();
        Ok(Self { slots })
    }

    pub fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }

    pub fn contains(&self, slot: FieldSlot) -> bool {
        self.slots.contains(&slot)
    }
}

impl fmt::Display for FieldMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .slots
            .iter()
            .map(|slot| format!("{}={}", slot.field_key(), slot.name()))
            .collect();
        f.write_str(&entries.join(","))
    }
}
