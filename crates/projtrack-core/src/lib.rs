//! Canonical forecast schema, gazetteer and shared domain types for projtrack.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "projtrack-core";

/// Canonical spelling of the national aggregate.
pub const US_CANONICAL_NAME: &str = "United States of America";

/// Composite primary key columns of the persisted table, in key order.
pub const KEY_COLUMNS: [&str; 4] = ["location_name", "date", "model_date", "model_name"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("model_version `{0}` does not start with a YYYY_MM_DD date")]
    UnparseableModelVersion(String),
    #[error("unknown model name `{0}`")]
    UnknownModelName(String),
    #[error("column `{0}` is not part of the canonical schema")]
    UnknownColumn(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Quantile {
    Mean,
    Lower,
    Upper,
}

impl Quantile {
    pub const ALL: [Quantile; 3] = [Quantile::Mean, Quantile::Lower, Quantile::Upper];

    pub const fn suffix(self) -> &'static str {
        match self {
            Quantile::Mean => "mean",
            Quantile::Lower => "lower",
            Quantile::Upper => "upper",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Quantile::Mean => "Mean",
            Quantile::Lower => "Lower",
            Quantile::Upper => "Upper",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Running total; its daily increment lives in a sibling metric.
    Cumulative,
    /// Per-day increment of a cumulative metric.
    Daily,
    /// Point-in-time level (beds in use, shortages).
    Level,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDef {
    pub key: &'static str,
    pub label: &'static str,
    pub kind: MetricKind,
}

const fn metric(key: &'static str, label: &'static str, kind: MetricKind) -> MetricDef {
    MetricDef { key, label, kind }
}

/// Metrics stored before `model_version`/`model_name` in the canonical column order.
const LEADING_METRICS: &[MetricDef] = &[
    metric("allbed", "All Beds Used", MetricKind::Level),
    metric("ICUbed", "ICU Beds Used", MetricKind::Level),
    metric("InvVen", "Ventilators Used", MetricKind::Level),
    metric("deaths", "Daily Deaths", MetricKind::Daily),
    metric("admis", "Hospital Admissions", MetricKind::Level),
    metric("newICU", "New ICU Patients", MetricKind::Level),
    metric("totdea", "Cumulative Deaths", MetricKind::Cumulative),
    metric("bedover", "All Beds Shortage", MetricKind::Level),
    metric("icuover", "ICU Beds Shortage", MetricKind::Level),
];

/// Metrics appended after the provider columns (added with the LANL case series).
const TRAILING_METRICS: &[MetricDef] = &[
    metric("confirmed", "Daily Confirmed Cases", MetricKind::Daily),
    metric("totcon", "Cumulative Confirmed Cases", MetricKind::Cumulative),
];

pub fn metrics() -> impl Iterator<Item = &'static MetricDef> {
    LEADING_METRICS.iter().chain(TRAILING_METRICS.iter())
}

pub fn metric_def(key: &str) -> Option<&'static MetricDef> {
    metrics().find(|m| m.key == key)
}

pub fn metric_column(metric: &str, quantile: Quantile) -> String {
    format!("{metric}_{}", quantile.suffix())
}

/// Human-readable label for a canonical metric column, e.g. `totdea_mean`.
pub fn metric_label(column: &str) -> Option<String> {
    let (key, suffix) = column.rsplit_once('_')?;
    let def = metric_def(key)?;
    let quantile = Quantile::ALL.into_iter().find(|q| q.suffix() == suffix)?;
    Some(format!("{} ({})", def.label, quantile.label()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Category,
    Date,
    Float,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
}

impl FieldDef {
    fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: false,
        }
    }

    fn optional(name: String, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            nullable: true,
        }
    }
}

/// Ordered, typed description of the normalized forecast table.
///
/// The same descriptor drives the merged snapshot column order, the table DDL
/// and the loader's validation of the live table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSchema {
    fields: Vec<FieldDef>,
}

impl CanonicalSchema {
    pub fn standard() -> Self {
        let mut fields = vec![
            FieldDef::required("location_name", FieldKind::Category),
            FieldDef::required("date", FieldKind::Date),
        ];
        push_metric_fields(&mut fields, LEADING_METRICS);
        fields.push(FieldDef::required("model_version", FieldKind::Text));
        fields.push(FieldDef::required("model_name", FieldKind::Category));
        push_metric_fields(&mut fields, TRAILING_METRICS);
        fields.push(FieldDef::required("model_date", FieldKind::Date));
        fields.push(FieldDef::optional("location_abbr".to_string(), FieldKind::Category));
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Metric columns in canonical order.
    pub fn metric_columns(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.kind == FieldKind::Float)
            .map(|f| f.name.as_str())
            .collect()
    }

    pub fn is_metric_column(&self, name: &str) -> bool {
        self.field(name).is_some_and(|f| f.kind == FieldKind::Float)
    }

    /// Canonical columns absent from `present`.
    pub fn missing_from<S: AsRef<str>>(&self, present: &[S]) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !present.iter().any(|p| p.as_ref() == f.name))
            .map(|f| f.name.clone())
            .collect()
    }
}

fn push_metric_fields(fields: &mut Vec<FieldDef>, defs: &[MetricDef]) {
    for def in defs {
        for quantile in Quantile::ALL {
            fields.push(FieldDef::optional(metric_column(def.key, quantile), FieldKind::Float));
        }
    }
}

/// Derives the forecast-issue date from the leading `YYYY_MM_DD` of a model version.
///
/// Only the first ten characters are read, so trailing suffixes such as
/// `.05.us` never influence the result.
pub fn model_date_from_version(model_version: &str) -> Result<NaiveDate, SchemaError> {
    let prefix = model_version
        .get(..10)
        .ok_or_else(|| SchemaError::UnparseableModelVersion(model_version.to_string()))?;
    NaiveDate::parse_from_str(&prefix.replace('_', "-"), "%Y-%m-%d")
        .map_err(|_| SchemaError::UnparseableModelVersion(model_version.to_string()))
}

/// Renders a forecast-issue date in the `YYYY_MM_DD` model version convention.
pub fn model_version_for_date(date: NaiveDate) -> String {
    date.format("%Y_%m_%d").to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CuScenario {
    NoIntervention,
    Contact80,
    Contact75,
    Contact70,
    Contact60,
    Contact50,
}

impl CuScenario {
    pub const ALL: [CuScenario; 6] = [
        CuScenario::NoIntervention,
        CuScenario::Contact80,
        CuScenario::Contact75,
        CuScenario::Contact70,
        CuScenario::Contact60,
        CuScenario::Contact50,
    ];

    /// Token used in CU file names.
    pub const fn file_token(self) -> &'static str {
        match self {
            CuScenario::NoIntervention => "nointerv",
            CuScenario::Contact80 => "80contact",
            CuScenario::Contact75 => "75contact",
            CuScenario::Contact70 => "70contact",
            CuScenario::Contact60 => "60contact",
            CuScenario::Contact50 => "50contact",
        }
    }
}

/// Forecast provider identity; part of the persisted primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ModelName {
    Ihme,
    Lanl,
    Cu(CuScenario),
}

const CU_PREFIX: &str = "CU_shamanlab_";

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelName::Ihme => f.write_str("IHME"),
            ModelName::Lanl => f.write_str("LANL"),
            ModelName::Cu(scenario) => write!(f, "{CU_PREFIX}{}", scenario.file_token()),
        }
    }
}

impl FromStr for ModelName {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IHME" => Ok(ModelName::Ihme),
            "LANL" => Ok(ModelName::Lanl),
            other => other
                .strip_prefix(CU_PREFIX)
                .and_then(|token| CuScenario::ALL.into_iter().find(|s| s.file_token() == token))
                .map(ModelName::Cu)
                .ok_or_else(|| SchemaError::UnknownModelName(other.to_string())),
        }
    }
}

impl From<ModelName> for String {
    fn from(value: ModelName) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for ModelName {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForecastKey {
    pub location_name: String,
    pub date: NaiveDate,
    pub model_date: NaiveDate,
    pub model_name: ModelName,
}

/// One provider's prediction for one location and observation date, as of one forecast issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    pub location_name: String,
    pub location_abbr: Option<String>,
    pub date: NaiveDate,
    pub model_version: String,
    pub model_date: NaiveDate,
    pub model_name: ModelName,
    pub metrics: BTreeMap<String, Option<f64>>,
}

impl ForecastRow {
    pub fn key(&self) -> ForecastKey {
        ForecastKey {
            location_name: self.location_name.clone(),
            date: self.date,
            model_date: self.model_date,
            model_name: self.model_name,
        }
    }

    pub fn metric(&self, column: &str) -> Option<f64> {
        self.metrics.get(column).copied().flatten()
    }
}

/// Normalized rows of one provider plus the metric columns they carry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForecastFrame {
    pub source_id: String,
    pub columns: Vec<String>,
    pub rows: Vec<ForecastRow>,
}

impl ForecastFrame {
    pub fn new(source_id: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            source_id: source_id.into(),
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

const LOCATION_ALIASES: &[(&str, &str)] = &[("US", US_CANONICAL_NAME)];

const GAZETTEER: &[(&str, &str)] = &[
    (US_CANONICAL_NAME, "US"),
    ("Alabama", "AL"),
    ("Alaska", "AK"),
    ("Arizona", "AZ"),
    ("Arkansas", "AR"),
    ("California", "CA"),
    ("Colorado", "CO"),
    ("Connecticut", "CT"),
    ("Delaware", "DE"),
    ("District of Columbia", "DC"),
    ("Florida", "FL"),
    ("Georgia", "GA"),
    ("Hawaii", "HI"),
    ("Idaho", "ID"),
    ("Illinois", "IL"),
    ("Indiana", "IN"),
    ("Iowa", "IA"),
    ("Kansas", "KS"),
    ("Kentucky", "KY"),
    ("Louisiana", "LA"),
    ("Maine", "ME"),
    ("Maryland", "MD"),
    ("Massachusetts", "MA"),
    ("Michigan", "MI"),
    ("Minnesota", "MN"),
    ("Mississippi", "MS"),
    ("Missouri", "MO"),
    ("Montana", "MT"),
    ("Nebraska", "NE"),
    ("Nevada", "NV"),
    ("New Hampshire", "NH"),
    ("New Jersey", "NJ"),
    ("New Mexico", "NM"),
    ("New York", "NY"),
    ("North Carolina", "NC"),
    ("North Dakota", "ND"),
    ("Ohio", "OH"),
    ("Oklahoma", "OK"),
    ("Oregon", "OR"),
    ("Pennsylvania", "PA"),
    ("Rhode Island", "RI"),
    ("South Carolina", "SC"),
    ("South Dakota", "SD"),
    ("Tennessee", "TN"),
    ("Texas", "TX"),
    ("Utah", "UT"),
    ("Vermont", "VT"),
    ("Virginia", "VA"),
    ("Washington", "WA"),
    ("West Virginia", "WV"),
    ("Wisconsin", "WI"),
    ("Wyoming", "WY"),
    ("American Samoa", "AS"),
    ("Guam", "GU"),
    ("Northern Mariana Islands", "MP"),
    ("Puerto Rico", "PR"),
    ("Virgin Islands", "VI"),
    // IHME sub-state regions
    ("King and Snohomish Counties (excluding Life Care Center), WA", "WA"),
    ("Life Care Center, Kirkland, WA", "WA"),
    ("Other Counties, WA", "WA"),
];

/// Maps provider spellings onto the canonical location name.
pub fn canonical_location(name: &str) -> String {
    let trimmed = name.trim();
    LOCATION_ALIASES
        .iter()
        .find(|(alias, _)| *alias == trimmed)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

pub fn is_state_abbr(abbr: &str) -> bool {
    abbr != "US" && GAZETTEER.iter().any(|(_, a)| *a == abbr)
}

/// Abbreviation for a canonical location name.
///
/// County-style names (`Cook County IL`) resolve to their trailing state code.
pub fn location_abbr(name: &str) -> Option<&'static str> {
    if let Some((_, abbr)) = GAZETTEER.iter().find(|(full, _)| *full == name) {
        return Some(abbr);
    }
    let (_, suffix) = name.trim_end().rsplit_once(' ')?;
    GAZETTEER
        .iter()
        .map(|(_, abbr)| *abbr)
        .find(|abbr| *abbr == suffix && is_state_abbr(abbr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_date_reads_only_the_leading_ten_characters() {
        let expected = NaiveDate::from_ymd_opt(2020, 4, 5).unwrap();
        assert_eq!(model_date_from_version("2020_04_05.05.us").unwrap(), expected);
        assert_eq!(model_date_from_version("2020_04_05").unwrap(), expected);
        assert_eq!(model_date_from_version("2020-04-05_website").unwrap(), expected);
        assert!(model_date_from_version("ihme-covid19").is_err());
        assert!(model_date_from_version("2020_04").is_err());
    }

    #[test]
    fn model_version_round_trips_through_date() {
        let date = NaiveDate::from_ymd_opt(2020, 5, 12).unwrap();
        assert_eq!(model_version_for_date(date), "2020_05_12");
        assert_eq!(model_date_from_version(&model_version_for_date(date)).unwrap(), date);
    }

    #[test]
    fn standard_schema_has_stable_order_and_key_columns() {
        let schema = CanonicalSchema::standard();
        let names = schema.column_names();
        assert_eq!(names[0], "location_name");
        assert_eq!(names[1], "date");
        assert_eq!(names[2], "allbed_mean");
        assert_eq!(names[29], "model_version");
        assert_eq!(names[30], "model_name");
        assert_eq!(names[31], "confirmed_mean");
        assert_eq!(names[names.len() - 2], "model_date");
        assert_eq!(names[names.len() - 1], "location_abbr");
        assert_eq!(schema.metric_columns().len(), 33);
        for key in KEY_COLUMNS {
            assert!(!schema.field(key).unwrap().nullable, "{key} must be non-null");
        }
    }

    #[test]
    fn missing_from_reports_absent_columns() {
        let schema = CanonicalSchema::standard();
        let mut present: Vec<String> = schema.column_names().iter().map(|s| s.to_string()).collect();
        present.retain(|c| c != "totcon_upper");
        assert_eq!(schema.missing_from(&present), vec!["totcon_upper".to_string()]);
    }

    #[test]
    fn labels_follow_metric_and_quantile() {
        assert_eq!(metric_label("totdea_mean").as_deref(), Some("Cumulative Deaths (Mean)"));
        assert_eq!(metric_label("ICUbed_upper").as_deref(), Some("ICU Beds Used (Upper)"));
        assert_eq!(metric_label("newICU_lower").as_deref(), Some("New ICU Patients (Lower)"));
        assert!(metric_label("est_infections_mean").is_none());
        assert!(metric_label("model_date").is_none());
    }

    #[test]
    fn model_names_parse_and_render() {
        for name in [
            ModelName::Ihme,
            ModelName::Lanl,
            ModelName::Cu(CuScenario::Contact80),
        ] {
            assert_eq!(name.to_string().parse::<ModelName>().unwrap(), name);
        }
        assert_eq!(ModelName::Cu(CuScenario::NoIntervention).to_string(), "CU_shamanlab_nointerv");
        assert!("YYG".parse::<ModelName>().is_err());
        assert_eq!(String::from(ModelName::Lanl), "LANL");
    }

    #[test]
    fn us_alias_is_canonicalized() {
        assert_eq!(canonical_location("US"), US_CANONICAL_NAME);
        assert_eq!(canonical_location(" New York "), "New York");
        assert_eq!(canonical_location("Italy"), "Italy");
    }

    #[test]
    fn abbreviations_cover_states_regions_and_counties() {
        assert_eq!(location_abbr("New York"), Some("NY"));
        assert_eq!(location_abbr(US_CANONICAL_NAME), Some("US"));
        assert_eq!(location_abbr("Other Counties, WA"), Some("WA"));
        assert_eq!(location_abbr("Cook County IL"), Some("IL"));
        assert_eq!(location_abbr("Italy"), None);
        assert_eq!(location_abbr("Something US"), None);
    }
}
