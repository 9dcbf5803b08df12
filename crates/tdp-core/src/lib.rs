//! Core domain model for TDP: the tender-notice target schema, raw and
//! remapped rows, and the ingestion error taxonomy.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod remap;
mod search;

pub use remap::{remap_row, ColumnMatch, ColumnPlan, ColumnReport, PrefixMatch};
pub use search::{
    Pagination, TenderPage, TenderQuery, TenderSort, TenderSummary, DEFAULT_PAGE_LIMIT,
    MAX_PAGE, MAX_PAGE_LIMIT,
};

pub const CRATE_NAME: &str = "tdp-core";

/// Table that receives every ingested snapshot.
pub const DESTINATION_TABLE: &str = "open_tender_notices";

/// Load-order column carried next to the schema fields.
pub const ORDINAL_COLUMN: &str = "ingest_ordinal";

pub const REFERENCE_NUMBER_FIELD: &str = "referenceNumber-numeroReference";
pub const TITLE_FIELD: &str = "title-titre-eng";
pub const PUBLICATION_DATE_FIELD: &str = "publicationDate-datePublication";
pub const CLOSING_DATE_FIELD: &str = "tenderClosingDate-appelOffresDateCloture";
pub const CONTRACT_START_FIELD: &str = "expectedContractStartDate-dateDebutContratPrevue";
pub const CONTRACT_END_FIELD: &str = "expectedContractEndDate-dateFinContratPrevue";
pub const STATUS_FIELD: &str = "tenderStatus-appelOffresStatut-eng";
pub const UNSPSC_DESCRIPTION_FIELD: &str = "unspscDescription-eng";
pub const CATEGORY_FIELD: &str = "procurementCategory-categorieApprovisionnement";
pub const REGIONS_OF_DELIVERY_FIELD: &str = "regionsOfDelivery-regionsLivraison-eng";

/// Bump together with a new migration whenever [`TARGET_FIELDS`] changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Ordered destination columns. Changing this list is a schema migration.
pub const TARGET_FIELDS: &[&str] = &[
    REFERENCE_NUMBER_FIELD,
    TITLE_FIELD,
    "amendmentNumber-numeroModification",
    "solicitationNumber-numeroSollicitation",
    PUBLICATION_DATE_FIELD,
    CLOSING_DATE_FIELD,
    "amendmentDate-dateModification",
    CONTRACT_START_FIELD,
    CONTRACT_END_FIELD,
    STATUS_FIELD,
    "gsin-nibs",
    "gsinDescription-nibsDescription-eng",
    "unspsc",
    UNSPSC_DESCRIPTION_FIELD,
    CATEGORY_FIELD,
    "noticeType-avisType-eng",
    "procurementMethod-methodeApprovisionnement-eng",
    "selectionCriteria-criteresSelection-eng",
    "limitedTenderingReason-raisonAppelOffresLimite-eng",
    "tradeAgreements-accordsCommerciaux-eng",
    "regionsOfOpportunity-regionAppelOffres-eng",
    REGIONS_OF_DELIVERY_FIELD,
    "contractingEntityName-nomEntitContractante-eng",
    "contractingEntityAddressLine-ligneAdresseEntiteContractante-eng",
    "contractingEntityAddressCity-entiteContractanteAdresseVille-eng",
    "contractingEntityAddressProvince-entiteContractanteAdresseProvince-eng",
    "contractingEntityAddressCountry-entiteContractanteAdressePays-eng",
    "endUserEntitiesName-nomEntitesUtilisateurFinal-eng",
    "endUserEntitiesAddress-adresseEntitesUtilisateurFinal-eng",
    "contactInfoName-informationsContactNom",
    "contactInfoEmail-informationsContactCourriel",
    "contactInfoPhone-contactInfoTelephone",
    "contactInfoAddressLine-contactInfoAdresseLigne-eng",
    "contactInfoCity-contacterInfoVille-eng",
    "contactInfoProvince-contacterInfoProvince-eng",
    "contactInfoCountry-contactInfoPays-eng",
    "noticeURL-URLavis-eng",
    "attachment-piecesJointes-eng",
    "tenderDescription-descriptionAppelOffres-eng",
];

/// Versioned, ordered set of destination field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetSchema {
    version: u32,
    fields: Vec<String>,
}

impl TargetSchema {
    /// Builds a schema from `fields`, keeping the first occurrence of any
    /// repeated name so that field order stays declaration order.
    pub fn new<I, S>(version: u32, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for field in fields {
            let field = field.into();
            if !field.is_empty() && !out.contains(&field) {
                out.push(field);
            }
        }
        Self {
            version,
            fields: out,
        }
    }

    pub fn canonical() -> Self {
        Self::new(SCHEMA_VERSION, TARGET_FIELDS.iter().copied())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }
}

impl Default for TargetSchema {
    fn default() -> Self {
        Self::canonical()
    }
}

/// One decoded CSV data row, keyed by the source file's own column names.
///
/// Cells beyond the header are discarded; a row shorter than the header simply
/// has no value for the trailing columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    columns: Arc<[String]>,
    values: Vec<String>,
}

impl RawRow {
    pub fn new(columns: Arc<[String]>, mut values: Vec<String>) -> Self {
        values.truncate(columns.len());
        Self { columns, values }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let (columns, values): (Vec<String>, Vec<String>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self::new(columns.into(), values)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.iter().find(|(name, _)| *name == column).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.columns
            .iter()
            .zip(self.values.iter())
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A raw row translated into target-schema keys.
///
/// Absent keys mean the source had no matching column (or no cell); present
/// empty strings mean the source explicitly provided an empty value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenderNotice {
    fields: BTreeMap<String, String>,
}

impl TenderNotice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn reference_number(&self) -> Option<&str> {
        self.get(REFERENCE_NUMBER_FIELD)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Values in schema order, `None` where the field is absent.
    pub fn values_in<'a>(&'a self, schema: &'a TargetSchema) -> impl Iterator<Item = Option<&'a str>> {
        schema.fields().iter().map(move |f| self.get(f))
    }

    /// JSON object with every schema field as a key, `null` where absent.
    pub fn to_schema_json(&self, schema: &TargetSchema) -> serde_json::Value {
        let object = schema
            .fields()
            .iter()
            .map(|field| {
                let value = self
                    .get(field)
                    .map(|v| serde_json::Value::String(v.to_string()))
                    .unwrap_or(serde_json::Value::Null);
                (field.clone(), value)
            })
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(object)
    }
}

/// A persisted notice together with its position in the loaded snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredNotice {
    pub ordinal: i64,
    pub notice: TenderNotice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Download,
    Parse,
    Clear,
    Load,
    Cancelled,
}

impl IngestStage {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestStage::Download => "download",
            IngestStage::Parse => "parse",
            IngestStage::Clear => "clear",
            IngestStage::Load => "load",
            IngestStage::Cancelled => "cancelled",
        }
    }
}

/// Stage-level ingestion failures. Each variant is fatal to its run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    #[error("download failed: {0}")]
    Download(String),
    #[error("csv parse failed: {0}")]
    Parse(String),
    #[error("clearing destination table failed: {0}")]
    Clear(String),
    #[error("loading tender notices failed: {0}")]
    Load(String),
    #[error("ingestion cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn stage(&self) -> IngestStage {
        match self {
            IngestError::Download(_) => IngestStage::Download,
            IngestError::Parse(_) => IngestStage::Parse,
            IngestError::Clear(_) => IngestStage::Clear,
            IngestError::Load(_) => IngestStage::Load,
            IngestError::Cancelled => IngestStage::Cancelled,
        }
    }
}
