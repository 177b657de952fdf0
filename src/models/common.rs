//! Units and measurement shapes shared by several record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RowError;
use crate::table::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BiologicalMaterial {
    Cells,
    Nuclei,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeUnit {
    #[serde(rename = "µl")]
    Microliter,
    #[serde(rename = "ml")]
    Milliliter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LengthUnit {
    #[serde(rename = "µm")]
    Micrometer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MassUnit {
    #[serde(rename = "ng")]
    Nanogram,
    #[serde(rename = "pg")]
    Picogram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellCountingMethod {
    #[serde(alias = "ao/pi")]
    Aopi,
    Brightfield,
    Dapi,
    TrypanBlue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub measured_at: DateTime<Utc>,
    pub unit: VolumeUnit,
    pub value: f64,
}

/// Cell or nucleus suspension quality measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "quantity", rename_all = "snake_case")]
pub enum SuspensionMeasurementData {
    Concentration {
        measured_at: DateTime<Utc>,
        instrument_name: Option<String>,
        counting_method: Option<CellCountingMethod>,
        unit: (BiologicalMaterial, VolumeUnit),
        value: f64,
    },
    Volume {
        measured_at: DateTime<Utc>,
        unit: VolumeUnit,
        value: f64,
    },
    Viability {
        measured_at: DateTime<Utc>,
        instrument_name: Option<String>,
        value: f64,
    },
    MeanDiameter {
        measured_at: DateTime<Utc>,
        instrument_name: Option<String>,
        unit: (BiologicalMaterial, LengthUnit),
        value: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NucleicAcidConcentration {
    pub value: f64,
    pub unit: (MassUnit, VolumeUnit),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NucleicAcidMeasurementData {
    Electrophoretic {
        measured_at: DateTime<Utc>,
        instrument_name: String,
        mean_size_bp: Option<f64>,
        sizing_range: (u32, u32),
        concentration: NucleicAcidConcentration,
    },
    Fluorometric {
        measured_at: DateTime<Utc>,
        instrument_name: String,
        concentration: NucleicAcidConcentration,
    },
}

/// A cDNA or library measurement with the person who took it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NucleicAcidMeasurement {
    pub measured_by: Uuid,
    pub data: NucleicAcidMeasurementData,
}

pub const TAPESTATION_GATE_MIN: &str = "tapestation_gate_range_minimum_(bp)";
pub const TAPESTATION_GATE_MAX: &str = "tapestation_gate_range_maximum_(bp)";
pub const TAPESTATION_CONCENTRATION: &str = "tapestation_concentration_(pg/µl)";

/// A TapeStation reading. Needs both gates and the pg/µl concentration;
/// otherwise the row simply has none.
pub fn tapestation(
    row: &Row,
    instrument_name: &str,
    measured_at: DateTime<Utc>,
    mean_size_key: Option<&str>,
) -> Result<Option<NucleicAcidMeasurementData>, RowError> {
    let Some(sizing_range) = sizing_range(row, TAPESTATION_GATE_MIN, TAPESTATION_GATE_MAX)? else {
        return Ok(None);
    };
    let Some(value) = row.float(TAPESTATION_CONCENTRATION)? else {
        return Ok(None);
    };
    let mean_size_bp = match mean_size_key {
        Some(key) => row.float(key)?,
        None => None,
    };
    Ok(Some(NucleicAcidMeasurementData::Electrophoretic {
        measured_at,
        instrument_name: instrument_name.to_string(),
        mean_size_bp,
        sizing_range,
        concentration: NucleicAcidConcentration {
            value,
            unit: (MassUnit::Picogram, VolumeUnit::Microliter),
        },
    }))
}

/// A Qubit reading in ng/µl.
pub fn qubit(
    row: &Row,
    key: &str,
    instrument_name: &str,
    measured_at: DateTime<Utc>,
) -> Result<Option<NucleicAcidMeasurementData>, RowError> {
    Ok(row
        .float(key)?
        .map(|value| NucleicAcidMeasurementData::Fluorometric {
            measured_at,
            instrument_name: instrument_name.to_string(),
            concentration: NucleicAcidConcentration {
                value,
                unit: (MassUnit::Nanogram, VolumeUnit::Microliter),
            },
        }))
}

pub fn concentration(
    row: &Row,
    key: &str,
    measured_at: DateTime<Utc>,
    material: BiologicalMaterial,
    instrument_name: Option<&str>,
    counting_method: Option<CellCountingMethod>,
) -> Result<Option<SuspensionMeasurementData>, RowError> {
    Ok(row
        .float(key)?
        .map(|value| SuspensionMeasurementData::Concentration {
            measured_at,
            instrument_name: instrument_name.map(str::to_string),
            counting_method,
            unit: (material, VolumeUnit::Milliliter),
            value,
        }))
}

pub fn volume(
    row: &Row,
    key: &str,
    measured_at: DateTime<Utc>,
) -> Result<Option<SuspensionMeasurementData>, RowError> {
    Ok(row
        .float(key)?
        .map(|value| SuspensionMeasurementData::Volume {
            measured_at,
            unit: VolumeUnit::Microliter,
            value,
        }))
}

pub fn viability(
    row: &Row,
    key: &str,
    measured_at: DateTime<Utc>,
    instrument_name: Option<&str>,
) -> Result<Option<SuspensionMeasurementData>, RowError> {
    Ok(row
        .percentage(key)?
        .map(|value| SuspensionMeasurementData::Viability {
            measured_at,
            instrument_name: instrument_name.map(str::to_string),
            value,
        }))
}

pub fn mean_diameter(
    row: &Row,
    key: &str,
    measured_at: DateTime<Utc>,
    material: BiologicalMaterial,
    instrument_name: Option<&str>,
) -> Result<Option<SuspensionMeasurementData>, RowError> {
    Ok(row
        .float(key)?
        .map(|value| SuspensionMeasurementData::MeanDiameter {
            measured_at,
            instrument_name: instrument_name.map(str::to_string),
            unit: (material, LengthUnit::Micrometer),
            value,
        }))
}

/// A µl volume column as a dated volume, as used for chip loading.
pub fn microliters(
    row: &Row,
    key: &str,
    measured_at: DateTime<Utc>,
) -> Result<Volume, RowError> {
    Ok(Volume {
        measured_at,
        unit: VolumeUnit::Microliter,
        value: row.require_float(key)?,
    })
}

/// TapeStation gate range, present only when both ends are.
pub fn sizing_range(
    row: &Row,
    min_key: &str,
    max_key: &str,
) -> Result<Option<(u32, u32)>, RowError> {
    let (Some(min), Some(max)) = (row.int(min_key)?, row.int(max_key)?) else {
        return Ok(None);
    };
    let to_u32 = |key: &str, value: i64| {
        u32::try_from(value)
            .map_err(|err| RowError::invalid(key, &value.to_string(), err.to_string()))
    };
    Ok(Some((to_u32(min_key, min)?, to_u32(max_key, max)?)))
}
