use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Result, Context};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::dataset::DatasetItem;
use crate::error::CrawlError;

/// Supported export formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json { pretty: bool },
    Csv,
    Xml,
}

impl ExportFormat {
    pub fn parse(format: &str, pretty: bool) -> Result<Self, CrawlError> {
        match format.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json { pretty }),
            "csv" => Ok(Self::Csv),
            "xml" => Ok(Self::Xml),
            other => Err(CrawlError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json { .. } => "json",
            Self::Csv => "csv",
            Self::Xml => "xml",
        }
    }
}

/// Envelope of a JSON export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonExport {
    pub items: Vec<DatasetItem>,
    pub metadata: ExportMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub count: usize,
    pub exported_at: DateTime<Utc>,
}

/// Serialize items in the requested format
pub fn export_dataset(items: &[DatasetItem], format: ExportFormat) -> Result<String> {
    debug!("Exporting {} items as {}", items.len(), format.extension());

    match format {
        ExportFormat::Json { pretty } => export_json(items, pretty),
        ExportFormat::Csv => export_csv(items),
        ExportFormat::Xml => export_xml(items),
    }
}

/// Serialize and write to a file
pub async fn export_to_file(items: &[DatasetItem], format: ExportFormat, output_path: &Path) -> Result<()> {
    let contents = export_dataset(items, format)?;

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await
                .context(format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    tokio::fs::write(output_path, contents).await
        .context(format!("Failed to write export file: {}", output_path.display()))?;

    Ok(())
}

pub fn export_json(items: &[DatasetItem], pretty: bool) -> Result<String> {
    let export = JsonExport {
        items: items.to_vec(),
        metadata: ExportMetadata {
            count: items.len(),
            exported_at: Utc::now(),
        },
    };

    let json = if pretty {
        serde_json::to_string_pretty(&export)
    } else {
        serde_json::to_string(&export)
    };

    json.context("Failed to serialize dataset to JSON")
}

/// Parse a JSON export back into items
pub fn import_json(contents: &str) -> Result<Vec<DatasetItem>> {
    let export: JsonExport = serde_json::from_str(contents)
        .context("Failed to parse JSON dataset export")?;
    Ok(export.items)
}

/// Flatten a payload into dotted scalar columns
fn flatten(prefix: &str, value: &Value, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let column = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&column, nested, out);
            }
        }
        other => {
            let column = if prefix.is_empty() { "value".to_string() } else { prefix.to_string() };
            out.insert(column, other.clone());
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Arrays stay as compact JSON in a single cell
        other => other.to_string(),
    }
}

pub fn export_csv(items: &[DatasetItem]) -> Result<String> {
    let rows: Vec<Map<String, Value>> = items
        .iter()
        .map(|item| {
            let mut row = Map::new();
            flatten("", &item.payload, &mut row);
            row
        })
        .collect();

    let columns: BTreeSet<&String> = rows.iter().flat_map(|row| row.keys()).collect();

    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header = vec!["url".to_string(), "content_hash".to_string()];
    header.extend(columns.iter().map(|c| c.to_string()));
    writer.write_record(&header).context("Failed to write CSV header")?;

    for (item, row) in items.iter().zip(&rows) {
        let mut record = vec![item.url.clone(), item.content_hash.clone()];
        record.extend(columns.iter().map(|c| row.get(*c).map(scalar_text).unwrap_or_default()));
        writer.write_record(&record).context("Failed to write CSV row")?;
    }

    let bytes = writer.into_inner().context("Failed to flush CSV writer")?;
    String::from_utf8(bytes).context("CSV output is not valid UTF-8")
}

pub fn export_xml(items: &[DatasetItem]) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let count = items.len().to_string();
    let mut root = BytesStart::new("dataset");
    root.push_attribute(("count", count.as_str()));
    writer.write_event(Event::Start(root))?;

    for item in items {
        let mut element = BytesStart::new("item");
        element.push_attribute(("url", item.url.as_str()));
        element.push_attribute(("content_hash", item.content_hash.as_str()));
        writer.write_event(Event::Start(element))?;

        let mut fields = Map::new();
        flatten("", &item.payload, &mut fields);

        for (name, value) in &fields {
            let mut field = BytesStart::new("field");
            field.push_attribute(("name", name.as_str()));
            writer.write_event(Event::Start(field))?;
            writer.write_event(Event::Text(BytesText::new(&scalar_text(value))))?;
            writer.write_event(Event::End(BytesEnd::new("field")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("item")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("dataset")))?;

    String::from_utf8(writer.into_inner()).context("XML output is not valid UTF-8")
}
