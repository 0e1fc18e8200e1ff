use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical hourly quantities carried by every assembled row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variable {
    Temperature,
    DewPoint,
    Pressure,
    RelativeHumidity,
    WindSpeed,
    WindDirection,
    Ghi,
    Dni,
    Dhi,
    CloudCover,
    Precipitation,
}

impl Variable {
    pub const ALL: [Variable; 11] = [
        Variable::Temperature,
        Variable::DewPoint,
        Variable::Pressure,
        Variable::RelativeHumidity,
        Variable::WindSpeed,
        Variable::WindDirection,
        Variable::Ghi,
        Variable::Dni,
        Variable::Dhi,
        Variable::CloudCover,
        Variable::Precipitation,
    ];

    /// Column header used in persisted series.
    pub fn column(&self) -> &'static str {
        match self {
            Variable::Temperature => "temperature",
            Variable::DewPoint => "dew_point",
            Variable::Pressure => "pressure",
            Variable::RelativeHumidity => "relative_humidity",
            Variable::WindSpeed => "wind_speed",
            Variable::WindDirection => "wind_direction",
            Variable::Ghi => "ghi",
            Variable::Dni => "dni",
            Variable::Dhi => "dhi",
            Variable::CloudCover => "cloud_cover",
            Variable::Precipitation => "precipitation",
        }
    }

    pub fn from_column(column: &str) -> Option<Variable> {
        Variable::ALL.into_iter().find(|v| v.column() == column)
    }

    /// Weight of this variable in the combined Finkelstein-Schafer score.
    ///
    /// Zero means the variable does not take part in month selection.
    pub fn selection_weight(&self) -> f64 {
        match self {
            Variable::Temperature => 0.40,
            Variable::DewPoint => 0.30,
            Variable::WindSpeed => 0.20,
            Variable::Ghi => 0.10,
            _ => 0.0,
        }
    }

    /// Variables that take part in month selection, most important first.
    pub fn selection_set() -> impl Iterator<Item = Variable> {
        Variable::ALL
            .into_iter()
            .filter(|v| v.selection_weight() > 0.0)
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Quantities requested from the upstream reanalysis provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderVariable {
    Temperature2m,
    Dewpoint2m,
    SurfacePressure,
    WindU10m,
    WindV10m,
    SolarRadiationDownwards,
    TotalCloudCover,
    TotalPrecipitation,
}

impl ProviderVariable {
    pub const ALL: [ProviderVariable; 8] = [
        ProviderVariable::Temperature2m,
        ProviderVariable::Dewpoint2m,
        ProviderVariable::SurfacePressure,
        ProviderVariable::WindU10m,
        ProviderVariable::WindV10m,
        ProviderVariable::SolarRadiationDownwards,
        ProviderVariable::TotalCloudCover,
        ProviderVariable::TotalPrecipitation,
    ];

    /// Long name used in requests.
    pub fn upstream_name(&self) -> &'static str {
        match self {
            ProviderVariable::Temperature2m => "2m_temperature",
            ProviderVariable::Dewpoint2m => "2m_dewpoint_temperature",
            ProviderVariable::SurfacePressure => "surface_pressure",
            ProviderVariable::WindU10m => "10m_u_component_of_wind",
            ProviderVariable::WindV10m => "10m_v_component_of_wind",
            ProviderVariable::SolarRadiationDownwards => "surface_solar_radiation_downwards",
            ProviderVariable::TotalCloudCover => "total_cloud_cover",
            ProviderVariable::TotalPrecipitation => "total_precipitation",
        }
    }

    /// Short code used as the column header in provider responses.
    pub fn short_code(&self) -> &'static str {
        match self {
            ProviderVariable::Temperature2m => "t2m",
            ProviderVariable::Dewpoint2m => "d2m",
            ProviderVariable::SurfacePressure => "sp",
            ProviderVariable::WindU10m => "u10",
            ProviderVariable::WindV10m => "v10",
            ProviderVariable::SolarRadiationDownwards => "ssrd",
            ProviderVariable::TotalCloudCover => "tcc",
            ProviderVariable::TotalPrecipitation => "tp",
        }
    }

    pub fn from_short_code(code: &str) -> Option<ProviderVariable> {
        ProviderVariable::ALL
            .into_iter()
            .find(|v| v.short_code() == code)
    }

    pub fn from_upstream_name(name: &str) -> Option<ProviderVariable> {
        ProviderVariable::ALL
            .into_iter()
            .find(|v| v.upstream_name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableGroup {
    Temperature,
    Pressure,
    Wind,
    Solar,
    Cloud,
    Precipitation,
    All,
}

impl VariableGroup {
    pub fn from_name(name: &str) -> Option<VariableGroup> {
        match name {
            "temperature" => Some(VariableGroup::Temperature),
            "pressure" => Some(VariableGroup::Pressure),
            "wind" => Some(VariableGroup::Wind),
            "solar" => Some(VariableGroup::Solar),
            "cloud" => Some(VariableGroup::Cloud),
            "precipitation" => Some(VariableGroup::Precipitation),
            "all" => Some(VariableGroup::All),
            _ => None,
        }
    }

    pub fn members(&self) -> &'static [ProviderVariable] {
        use ProviderVariable::*;
        match self {
            VariableGroup::Temperature => &[Temperature2m, Dewpoint2m],
            VariableGroup::Pressure => &[SurfacePressure],
            VariableGroup::Wind => &[WindU10m, WindV10m],
            VariableGroup::Solar => &[SolarRadiationDownwards],
            VariableGroup::Cloud => &[TotalCloudCover],
            VariableGroup::Precipitation => &[TotalPrecipitation],
            VariableGroup::All => &ProviderVariable::ALL,
        }
    }
}

/// Expand group names and upstream variable names into a request set.
///
/// An empty selection means every provider variable. Order follows first
/// appearance; duplicates are dropped.
pub fn resolve_variables<S: AsRef<str>>(names: &[S]) -> Result<Vec<ProviderVariable>> {
    if names.is_empty() {
        return Ok(ProviderVariable::ALL.to_vec());
    }

    let mut resolved: Vec<ProviderVariable> = Vec::new();
    for name in names {
        let name = name.as_ref().trim();
        let members: Vec<ProviderVariable> = if let Some(group) = VariableGroup::from_name(name) {
            group.members().to_vec()
        } else if let Some(var) = ProviderVariable::from_upstream_name(name) {
            vec![var]
        } else {
            return Err(AppError::Config(format!(
                "Unknown variable or group '{}'",
                name
            )));
        };

        for var in members {
            if !resolved.contains(&var) {
                resolved.push(var);
            }
        }
    }

    Ok(resolved)
}
