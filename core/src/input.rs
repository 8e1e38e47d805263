//! Input resolution: turn an [`InputConfig`] into the ordered row sequence
//! the orchestrator processes. Inline rows pass through; file sources are
//! parsed by format, with `auto` resolved from the file extension.

use serde_json::Value;
use verdict_protocol::config::CsvOptions;
use verdict_protocol::config::FileInput;
use verdict_protocol::config::InputConfig;
use verdict_protocol::config::InputFormat;
use verdict_protocol::config::InputSource;
use verdict_protocol::items::EvaluationInput;

use crate::error::Result;
use crate::error::VerdictErr;

pub async fn resolve_rows(config: &InputConfig) -> Result<Vec<EvaluationInput>> {
    match &config.source {
        InputSource::Inline(rows) => Ok(rows.clone()),
        InputSource::File(file) => resolve_file(file).await,
    }
}

async fn resolve_file(file: &FileInput) -> Result<Vec<EvaluationInput>> {
    let format = detect_format(file)?;
    let content = tokio::fs::read_to_string(&file.path)
        .await
        .map_err(|err| VerdictErr::io(format!("reading {}", file.path.display()), err))?;
    match format {
        InputFormat::Csv => parse_csv_rows(file, &content),
        InputFormat::Json => parse_json_rows(file, &content),
        InputFormat::Auto => unreachable!("detect_format never returns Auto"),
    }
}

fn detect_format(file: &FileInput) -> Result<InputFormat> {
    match file.format {
        InputFormat::Auto => match file.path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Ok(InputFormat::Csv),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(InputFormat::Json),
            _ => Err(VerdictErr::UnknownInputFormat {
                path: file.path.clone(),
            }),
        },
        format => Ok(format),
    }
}

fn parse_csv_rows(file: &FileInput, content: &str) -> Result<Vec<EvaluationInput>> {
    let options = &file.csv;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(options.delimiter as u8)
        .quote(options.quote as u8)
        .has_headers(options.has_headers)
        .from_reader(content.as_bytes());

    let headers: Option<Vec<String>> = if options.has_headers {
        let record = reader.headers().map_err(|err| VerdictErr::Parse {
            path: file.path.clone(),
            detail: err.to_string(),
        })?;
        let mut headers: Vec<String> = record.iter().map(str::to_string).collect();
        if let Some(first) = headers.first_mut() {
            *first = first.trim_start_matches('\u{feff}').to_string();
        }
        Some(headers)
    } else {
        None
    };

    let mut rows = Vec::new();
    let mut index = 0;
    for record in reader.records() {
        let record = record.map_err(|err| VerdictErr::Parse {
            path: file.path.clone(),
            detail: err.to_string(),
        })?;
        let fields: Vec<String> = record.iter().map(str::to_string).collect();
        if options.skip_empty_lines && fields.iter().all(String::is_empty) {
            continue;
        }
        let columns: Vec<String> = match &headers {
            Some(headers) => headers.clone(),
            None => (0..fields.len()).map(|i| format!("column{i}")).collect(),
        };
        rows.push(row_from_fields(options, &columns, &fields, index)?);
        index += 1;
    }
    Ok(rows)
}

fn row_from_fields(
    options: &CsvOptions,
    columns: &[String],
    fields: &[String],
    index: usize,
) -> Result<EvaluationInput> {
    let mut row = EvaluationInput::default();
    for (position, column) in columns.iter().enumerate() {
        let value = fields.get(position).cloned().unwrap_or_default();
        let target = options
            .field_map
            .get(column)
            .map(String::as_str)
            .unwrap_or(column.as_str());
        match target {
            "candidateText" => row.candidate_text = value,
            "referenceText" => row.reference_text = non_empty(value),
            "sourceText" => row.source_text = non_empty(value),
            "prompt" => row.prompt = non_empty(value),
            "contentType" => row.content_type = non_empty(value),
            "language" => row.language = non_empty(value),
            "id" => row.id = non_empty(value),
            other => {
                row.extra.insert(other.to_string(), Value::String(value));
            }
        }
    }
    if row.candidate_text.is_empty() {
        return Err(VerdictErr::MissingCandidate { row: index });
    }
    Ok(row)
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() { None } else { Some(value) }
}

fn parse_json_rows(file: &FileInput, content: &str) -> Result<Vec<EvaluationInput>> {
    let document: Value = serde_json::from_str(content).map_err(|err| VerdictErr::Parse {
        path: file.path.clone(),
        detail: err.to_string(),
    })?;

    let records_path = file.json.records_path.as_deref().unwrap_or("");
    let mut target = &document;
    if !records_path.is_empty() {
        for segment in records_path.split('.') {
            target = target
                .get(segment)
                .ok_or_else(|| VerdictErr::RecordsPathNotArray {
                    path: records_path.to_string(),
                })?;
        }
    }
    let records = target
        .as_array()
        .ok_or_else(|| VerdictErr::RecordsPathNotArray {
            path: if records_path.is_empty() {
                "<root>".to_string()
            } else {
                records_path.to_string()
            },
        })?;

    let mut rows = Vec::with_capacity(records.len());
    for (index, record) in records.iter().enumerate() {
        if !record.is_object() {
            return Err(VerdictErr::InvalidRecord {
                index,
                detail: "expected a keyed aggregate".to_string(),
            });
        }
        let row: EvaluationInput =
            serde_json::from_value(record.clone()).map_err(|err| VerdictErr::InvalidRecord {
                index,
                detail: err.to_string(),
            })?;
        if row.candidate_text.is_empty() {
            return Err(VerdictErr::MissingCandidate { row: index });
        }
        rows.push(row);
    }
    Ok(rows)
}
