//! Row projection and the post-hoc bulk exporters. The streaming sink reuses
//! the projection and CSV rendering here so streamed and bulk artifacts
//! agree on shape.

use chrono::SecondsFormat;
use chrono::Utc;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use verdict_protocol::config::ExportSettings;
use verdict_protocol::config::WebhookMethod;
use verdict_protocol::config::WebhookSettings;
use verdict_protocol::items::BatchResult;
use verdict_protocol::items::RowResult;

use crate::config::ExportOptions;
use crate::error::Result;
use crate::error::VerdictErr;

/// Top-level keys of a serialized [`RowResult`], in the order they appear in
/// flattened delimited-text records.
const ROW_KEYS: [&str; 9] = [
    "id",
    "index",
    "input",
    "outcomes",
    "combinedScore",
    "completedAt",
    "durationMs",
    "retryCount",
    "error",
];

/// Input fields that get their own named column; everything else in the
/// input object is emitted as `input_<name>`. The row's own `id` column
/// takes precedence, so an input-level id is prefixed like an extra field.
const NAMED_INPUT_FIELDS: [&str; 6] = [
    "candidateText",
    "referenceText",
    "sourceText",
    "prompt",
    "contentType",
    "language",
];

/// Applies the user predicate and the include/exclude field lists. Returns
/// `None` when the row is filtered out entirely.
pub(crate) fn project_result(
    result: &RowResult,
    options: &ExportOptions,
) -> Result<Option<Map<String, Value>>> {
    if let Some(filter) = &options.filter
        && !filter.include(result)
    {
        return Ok(None);
    }
    let value = serde_json::to_value(result)?;
    let Value::Object(mut map) = value else {
        return Err(VerdictErr::Serde(serde::ser::Error::custom(
            "row result did not serialize to an object",
        )));
    };
    if let Some(include) = &options.settings.include_fields {
        map.retain(|key, _| include.iter().any(|field| field == key));
    }
    if let Some(exclude) = &options.settings.exclude_fields {
        map.retain(|key, _| !exclude.iter().any(|field| field == key));
    }
    Ok(Some(map))
}

fn field_allowed(settings: &ExportSettings, key: &str) -> bool {
    if let Some(include) = &settings.include_fields
        && !include.iter().any(|field| field == key)
    {
        return false;
    }
    if let Some(exclude) = &settings.exclude_fields
        && exclude.iter().any(|field| field == key)
    {
        return false;
    }
    true
}

pub(crate) fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        let escaped = field.replace('"', "\"\"");
        format!("\"{escaped}\"")
    } else {
        field.to_string()
    }
}

fn value_to_csv_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Flattens a projected row into ordered `(column, value)` pairs.
///
/// The input object expands into named columns plus `input_<name>` extras;
/// outcomes either flatten into per-evaluator columns (a single evaluator is
/// unprefixed, multiple get `eval<i>_`, 1-based) or collapse into one JSON
/// string under `results`. The `error` column is always present unless the
/// caller excluded it, so failed rows line up with successful ones.
pub(crate) fn flat_record(
    projected: &Map<String, Value>,
    settings: &ExportSettings,
) -> Vec<(String, String)> {
    let mut record: Vec<(String, String)> = Vec::new();
    for key in ROW_KEYS {
        match (key, projected.get(key)) {
            ("input", Some(Value::Object(input))) => {
                for field in NAMED_INPUT_FIELDS {
                    if let Some(value) = input.get(field) {
                        record.push((field.to_string(), value_to_csv_string(value)));
                    }
                }
                for (field, value) in input {
                    if NAMED_INPUT_FIELDS.contains(&field.as_str()) {
                        continue;
                    }
                    record.push((format!("input_{field}"), value_to_csv_string(value)));
                }
            }
            ("outcomes", Some(Value::Array(outcomes))) => {
                if settings.flatten_results {
                    flatten_outcomes(outcomes, &mut record);
                } else {
                    record.push((
                        "results".to_string(),
                        Value::Array(outcomes.clone()).to_string(),
                    ));
                }
            }
            ("error", value) => {
                if field_allowed(settings, "error") {
                    let rendered = value.map(value_to_csv_string).unwrap_or_default();
                    record.push(("error".to_string(), rendered));
                }
            }
            (_, Some(value)) => record.push((key.to_string(), value_to_csv_string(value))),
            (_, None) => {}
        }
    }
    record
}

fn flatten_outcomes(outcomes: &[Value], record: &mut Vec<(String, String)>) {
    let single = outcomes.len() == 1;
    for (position, outcome) in outcomes.iter().enumerate() {
        let prefix = if single {
            String::new()
        } else {
            format!("eval{}_", position + 1)
        };
        if let Some(evaluator) = outcome.get("evaluator") {
            record.push((
                format!("{prefix}evaluator"),
                value_to_csv_string(evaluator),
            ));
        }
        if let Some(score) = outcome.get("score") {
            record.push((format!("{prefix}score"), value_to_csv_string(score)));
        }
        if let Some(feedback) = outcome.get("feedback") {
            record.push((format!("{prefix}feedback"), value_to_csv_string(feedback)));
        }
        if let Some(execution) = outcome
            .get("stats")
            .and_then(|stats| stats.get("executionTimeMs"))
        {
            record.push((
                format!("{prefix}executionTimeMs"),
                value_to_csv_string(execution),
            ));
        }
        if let Some(total) = outcome
            .get("stats")
            .and_then(|stats| stats.get("tokens"))
            .and_then(|tokens| tokens.get("total"))
        {
            record.push((format!("{prefix}totalTokens"), value_to_csv_string(total)));
        }
        if let Some(error) = outcome.get("error") {
            // Unprefixed, this would collide with the row-level column.
            let column = if single {
                "evaluatorError".to_string()
            } else {
                format!("{prefix}error")
            };
            record.push((column, value_to_csv_string(error)));
        }
    }
}

/// Column layout of a delimited-text destination, fixed by the first exported
/// row. Later rows fill missing cells with the empty string; columns they
/// introduce are dropped.
#[derive(Debug)]
pub(crate) struct CsvLayout {
    columns: Vec<String>,
}

impl CsvLayout {
    pub(crate) fn from_record(record: &[(String, String)]) -> Self {
        Self {
            columns: record.iter().map(|(column, _)| column.clone()).collect(),
        }
    }

    pub(crate) fn header_line(&self) -> String {
        let mut line = self
            .columns
            .iter()
            .map(|column| csv_escape(column))
            .collect::<Vec<_>>()
            .join(",");
        line.push('\n');
        line
    }

    pub(crate) fn line(&self, record: &[(String, String)]) -> String {
        let mut line = self
            .columns
            .iter()
            .map(|column| {
                let value = record
                    .iter()
                    .find(|(name, _)| name == column)
                    .map(|(_, value)| value.as_str())
                    .unwrap_or_default();
                csv_escape(value)
            })
            .collect::<Vec<_>>()
            .join(",");
        line.push('\n');
        line
    }
}

pub(crate) fn require_path(settings: &ExportSettings) -> Result<&std::path::Path> {
    settings
        .path
        .as_deref()
        .ok_or(VerdictErr::MissingExportPath {
            format: settings.format,
        })
}

pub(crate) fn require_webhook(settings: &ExportSettings) -> Result<&WebhookSettings> {
    settings
        .webhook
        .as_ref()
        .ok_or(VerdictErr::MissingWebhookSettings)
}

pub(crate) fn build_webhook_client(settings: &WebhookSettings) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_millis(settings.timeout_ms))
        .build()
        .map_err(|err| VerdictErr::Webhook {
            url: settings.url.clone(),
            detail: err.to_string(),
        })
}

/// Posts one payload to the webhook. A transport failure or non-2xx status
/// comes back as a rendered message; retry policy is the caller's concern.
pub(crate) async fn post_webhook(
    client: &reqwest::Client,
    settings: &WebhookSettings,
    payload: &Value,
) -> std::result::Result<(), String> {
    let method = match settings.method {
        WebhookMethod::Post => reqwest::Method::POST,
        WebhookMethod::Put => reqwest::Method::PUT,
    };
    let mut request = client.request(method, &settings.url).json(payload);
    for (name, value) in &settings.headers {
        request = request.header(name, value);
    }
    let response = request.send().await.map_err(|err| err.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("webhook returned status {status}"));
    }
    Ok(())
}

pub(crate) fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Bulk delimited-text export of the accumulated results.
pub(crate) async fn export_rows_csv(results: &[RowResult], options: &ExportOptions) -> Result<()> {
    let path = require_path(&options.settings)?;
    let mut records = Vec::new();
    for result in results {
        if let Some(projected) = project_result(result, options)? {
            records.push(flat_record(&projected, &options.settings));
        }
    }

    let existing_len = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.len(),
        Err(_) => 0,
    };
    let append = options.settings.append_to_existing && existing_len > 0;

    let mut content = String::new();
    if let Some(first) = records.first() {
        let layout = CsvLayout::from_record(first);
        if !append {
            content.push_str(&layout.header_line());
        }
        for record in &records {
            content.push_str(&layout.line(record));
        }
    }

    let io_err = |err| VerdictErr::io(format!("writing {}", path.display()), err);
    if append {
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(io_err)?;
        file.write_all(content.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
    } else {
        tokio::fs::write(path, content).await.map_err(io_err)?;
    }
    Ok(())
}

/// Bulk structured-document export: the full batch result, pretty-printed,
/// so the artifact parses back into a [`BatchResult`].
pub(crate) async fn export_batch_json(batch: &BatchResult, options: &ExportOptions) -> Result<()> {
    let path = require_path(&options.settings)?;
    let mut content = serde_json::to_vec_pretty(batch)?;
    content.push(b'\n');
    tokio::fs::write(path, content)
        .await
        .map_err(|err| VerdictErr::io(format!("writing {}", path.display()), err))
}

/// Bulk webhook export: projected rows in chunks of `batch_size`. Unlike the
/// streaming webhook sink, failures here propagate to the caller.
pub(crate) async fn export_rows_webhook(
    results: &[RowResult],
    options: &ExportOptions,
) -> Result<()> {
    let webhook = require_webhook(&options.settings)?;
    let client = build_webhook_client(webhook)?;

    let mut projections = Vec::new();
    for result in results {
        if let Some(projected) = project_result(result, options)? {
            projections.push(Value::Object(projected));
        }
    }

    let batch_size = options.settings.batch_size.max(1);
    for chunk in projections.chunks(batch_size) {
        let payload = json!({
            "timestamp": timestamp(),
            "results": chunk,
            "count": chunk.len(),
        });
        post_webhook(&client, webhook, &payload)
            .await
            .map_err(|detail| VerdictErr::Webhook {
                url: webhook.url.clone(),
                detail,
            })?;
    }
    Ok(())
}
