//! Document source over the MongoDB client.

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::TryStreamExt;
use mongodb::{Client, Collection};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use regex::Regex;
use serde_json::Value;

use crate::errors::{DbtapError, Result};
use crate::settings::{ConnectionProfile, SourceKind};
use crate::source::{Record, RecordSource, ResultSet};

/// ISO instants in query text are rewritten to native datetimes so range
/// filters compare against stored timestamps instead of strings.
const ISO_DATETIME_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z$";

fn iso_datetime_regex() -> Result<Regex> {
    Ok(Regex::new(ISO_DATETIME_PATTERN)?)
}

fn json_to_bson(value: &Value, re: &Regex) -> Result<Bson> {
    match value {
        Value::String(s) if re.is_match(s) => {
            let dt = bson::DateTime::parse_rfc3339_str(s).map_err(|e| {
                DbtapError::ConfigInvalid(format!("invalid datetime literal '{s}': {e}"))
            })?;
            Ok(Bson::DateTime(dt))
        }
        Value::Array(items) => Ok(Bson::Array(
            items
                .iter()
                .map(|item| json_to_bson(item, re))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Object(map) => {
            let mut doc = Document::new();
            for (key, item) in map {
                doc.insert(key.clone(), json_to_bson(item, re)?);
            }
            Ok(Bson::Document(doc))
        }
        other => Ok(bson::to_bson(other)?),
    }
}

/// Parse aggregation-pipeline JSON into BSON stages, rewriting ISO datetime
/// strings along the way.
pub fn parse_pipeline(query: &str) -> Result<Vec<Document>> {
    let parsed: Value = serde_json::from_str(query.trim())
        .map_err(|e| DbtapError::ConfigInvalid(format!("Invalid document query string: {e}")))?;
    let stages = match parsed {
        Value::Array(stages) => stages,
        other => vec![other],
    };

    let re = iso_datetime_regex()?;
    stages
        .iter()
        .map(|stage| match json_to_bson(stage, &re)? {
            Bson::Document(doc) => Ok(doc),
            _ => Err(DbtapError::ConfigInvalid(
                "each aggregation stage must be an object".to_string(),
            )),
        })
        .collect()
}

/// Convert one BSON value into its writable JSON form: object-ids and
/// timestamps become strings, binary decodes as UTF-8 with replacement,
/// containers recurse.
pub fn normalize_bson(value: &Bson) -> Value {
    match value {
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => dt
            .try_to_rfc3339_string()
            .map(Value::String)
            .unwrap_or(Value::Null),
        Bson::Timestamp(ts) => Value::String(format!("Timestamp({}, {})", ts.time, ts.increment)),
        Bson::Binary(bin) => Value::String(String::from_utf8_lossy(&bin.bytes).into_owned()),
        Bson::Decimal128(dec) => Value::String(dec.to_string()),
        Bson::Document(doc) => Value::Object(normalize_document(doc)),
        Bson::Array(items) => Value::Array(items.iter().map(normalize_bson).collect()),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::Null => Value::Null,
        other => Value::String(other.to_string()),
    }
}

pub fn normalize_document(doc: &Document) -> Record {
    doc.iter()
        .map(|(key, value)| (key.clone(), normalize_bson(value)))
        .collect()
}

/// Cross-document field union in first-seen order; this is the CSV header
/// when documents carry uneven field sets.
pub fn field_union(records: &[Record]) -> Vec<String> {
    let mut seen = indexmap::IndexSet::new();
    for record in records {
        for key in record.keys() {
            seen.insert(key.clone());
        }
    }
    seen.into_iter().collect()
}

fn document_uri(profile: &ConnectionProfile) -> Result<String> {
    let user = utf8_percent_encode(&profile.username, NON_ALPHANUMERIC);
    let pass = utf8_percent_encode(&profile.password, NON_ALPHANUMERIC);
    match profile.kind {
        SourceKind::MongoDb => Ok(format!("mongodb://{user}:{pass}@{}", profile.server)),
        SourceKind::MongoDbSrv => Ok(format!("mongodb+srv://{user}:{pass}@{}", profile.server)),
        _ => Err(DbtapError::ConfigInvalid(format!(
            "connection to '{}' is relational, not a document source",
            profile.server
        ))),
    }
}

/// Aggregation-backed document source. One instance per task.
pub struct DocumentSource {
    collection: Collection<Document>,
}

impl DocumentSource {
    pub async fn connect(profile: &ConnectionProfile) -> Result<Self> {
        let collection_name = profile.collection.as_deref().ok_or_else(|| {
            DbtapError::ConfigInvalid("document connection is missing 'collection'".to_string())
        })?;
        let client = Client::with_uri_str(document_uri(profile)?).await?;
        let collection = client
            .database(&profile.database)
            .collection::<Document>(collection_name);
        Ok(Self { collection })
    }
}

#[async_trait]
impl RecordSource for DocumentSource {
    async fn execute(&self, query: &str) -> Result<ResultSet> {
        let pipeline = parse_pipeline(query)?;

        let mut cursor = self
            .collection
            .aggregate(pipeline)
            .allow_disk_use(true)
            .await?;

        let mut records = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            records.push(normalize_document(&doc));
        }

        let columns = field_union(&records);
        Ok(ResultSet { columns, records })
    }
}
