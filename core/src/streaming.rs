//! Incremental export of committed rows. The destination is routed once at
//! initialization; per-row writes are serialized by the orchestrator.
//!
//! File destinations propagate write failures so the row can be retried as a
//! whole (export is a precondition of commit). The webhook destination
//! retries once and then swallows the failure: external availability must
//! not become a liveness dependency of the batch.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::warn;
use verdict_protocol::config::ExportFormat;
use verdict_protocol::config::WebhookSettings;
use verdict_protocol::items::RowResult;

use crate::config::ExportOptions;
use crate::error::Result;
use crate::error::VerdictErr;
use crate::export;
use crate::export::CsvLayout;

const WEBHOOK_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum StreamingSink {
    Csv(CsvStreamSink),
    Json(JsonStreamSink),
    Webhook(WebhookStreamSink),
}

impl StreamingSink {
    /// Routes by the destination tag and validates the destination up front;
    /// no per-row dispatch decisions are made after this point.
    pub fn from_options(options: &ExportOptions) -> Result<Self> {
        match options.settings.format {
            ExportFormat::Csv => {
                let path = export::require_path(&options.settings)?.to_path_buf();
                Ok(Self::Csv(CsvStreamSink {
                    options: options.clone(),
                    path,
                    file: None,
                    layout: None,
                    needs_header: true,
                }))
            }
            ExportFormat::Json => {
                let path = export::require_path(&options.settings)?.to_path_buf();
                Ok(Self::Json(JsonStreamSink {
                    options: options.clone(),
                    path,
                    file: None,
                    first: true,
                }))
            }
            ExportFormat::Webhook => {
                let settings = export::require_webhook(&options.settings)?.clone();
                let client = export::build_webhook_client(&settings)?;
                Ok(Self::Webhook(WebhookStreamSink {
                    options: options.clone(),
                    settings,
                    client,
                }))
            }
        }
    }

    pub async fn initialize(&mut self) -> Result<()> {
        match self {
            Self::Csv(sink) => sink.initialize().await,
            Self::Json(sink) => sink.initialize().await,
            Self::Webhook(_) => Ok(()),
        }
    }

    /// Writes one committed row. Returning `Ok` is the acknowledgement the
    /// orchestrator requires before the row may be committed to memory.
    pub async fn export_result(&mut self, result: &RowResult) -> Result<()> {
        match self {
            Self::Csv(sink) => sink.export_result(result).await,
            Self::Json(sink) => sink.export_result(result).await,
            Self::Webhook(sink) => sink.export_result(result).await,
        }
    }

    pub async fn finalize(&mut self) -> Result<()> {
        match self {
            Self::Csv(sink) => sink.finalize().await,
            Self::Json(sink) => sink.finalize().await,
            Self::Webhook(_) => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct CsvStreamSink {
    options: ExportOptions,
    path: PathBuf,
    file: Option<File>,
    layout: Option<CsvLayout>,
    needs_header: bool,
}

impl CsvStreamSink {
    async fn initialize(&mut self) -> Result<()> {
        let existing_len = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(_) => 0,
        };
        let append = self.options.settings.append_to_existing && existing_len > 0;
        let file = if append {
            self.needs_header = false;
            OpenOptions::new()
                .append(true)
                .open(&self.path)
                .await
                .map_err(|err| self.io_err(err))?
        } else {
            self.needs_header = true;
            File::create(&self.path)
                .await
                .map_err(|err| self.io_err(err))?
        };
        self.file = Some(file);
        Ok(())
    }

    async fn export_result(&mut self, result: &RowResult) -> Result<()> {
        let Some(projected) = export::project_result(result, &self.options)? else {
            return Ok(());
        };
        let record = export::flat_record(&projected, &self.options.settings);
        if self.layout.is_none() {
            self.layout = Some(CsvLayout::from_record(&record));
        }
        let Some(layout) = &self.layout else {
            return Ok(());
        };

        let mut content = String::new();
        if self.needs_header {
            content.push_str(&layout.header_line());
            self.needs_header = false;
        }
        content.push_str(&layout.line(&record));

        let path = self.path.clone();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| VerdictErr::io(
                format!("writing {}", path.display()),
                std::io::Error::other("sink was not initialized"),
            ))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|err| VerdictErr::io(format!("writing {}", path.display()), err))?;
        file.flush()
            .await
            .map_err(|err| VerdictErr::io(format!("writing {}", path.display()), err))?;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await.map_err(|err| {
                VerdictErr::io(format!("flushing {}", self.path.display()), err)
            })?;
        }
        Ok(())
    }

    fn io_err(&self, err: std::io::Error) -> VerdictErr {
        VerdictErr::io(format!("opening {}", self.path.display()), err)
    }
}

#[derive(Debug)]
pub struct JsonStreamSink {
    options: ExportOptions,
    path: PathBuf,
    file: Option<File>,
    first: bool,
}

impl JsonStreamSink {
    async fn initialize(&mut self) -> Result<()> {
        let mut file = File::create(&self.path)
            .await
            .map_err(|err| self.io_err("opening", err))?;
        file.write_all(b"[")
            .await
            .map_err(|err| self.io_err("writing", err))?;
        self.file = Some(file);
        self.first = true;
        Ok(())
    }

    async fn export_result(&mut self, result: &RowResult) -> Result<()> {
        let Some(projected) = export::project_result(result, &self.options)? else {
            return Ok(());
        };
        let rendered = serde_json::to_string(&Value::Object(projected))?;
        let chunk = if self.first {
            format!("\n  {rendered}")
        } else {
            format!(",\n  {rendered}")
        };
        self.first = false;

        let path = self.path.clone();
        let file = self.file.as_mut().ok_or_else(|| VerdictErr::io(
            format!("writing {}", path.display()),
            std::io::Error::other("sink was not initialized"),
        ))?;
        file.write_all(chunk.as_bytes())
            .await
            .map_err(|err| VerdictErr::io(format!("writing {}", path.display()), err))?;
        file.flush()
            .await
            .map_err(|err| VerdictErr::io(format!("writing {}", path.display()), err))?;
        Ok(())
    }

    async fn finalize(&mut self) -> Result<()> {
        let path = self.path.clone();
        if let Some(file) = self.file.as_mut() {
            file.write_all(b"\n]\n")
                .await
                .map_err(|err| VerdictErr::io(format!("finalizing {}", path.display()), err))?;
            file.flush()
                .await
                .map_err(|err| VerdictErr::io(format!("finalizing {}", path.display()), err))?;
        }
        Ok(())
    }

    fn io_err(&self, action: &str, err: std::io::Error) -> VerdictErr {
        VerdictErr::io(format!("{action} {}", self.path.display()), err)
    }
}

#[derive(Debug)]
pub struct WebhookStreamSink {
    options: ExportOptions,
    settings: WebhookSettings,
    client: reqwest::Client,
}

impl WebhookStreamSink {
    async fn export_result(&mut self, result: &RowResult) -> Result<()> {
        let Some(projected) = export::project_result(result, &self.options)? else {
            return Ok(());
        };
        let payload = json!({
            "timestamp": export::timestamp(),
            "result": Value::Object(projected),
        });

        if let Err(first) = export::post_webhook(&self.client, &self.settings, &payload).await {
            warn!(url = %self.settings.url, "webhook delivery failed, retrying once: {first}");
            sleep(WEBHOOK_RETRY_DELAY).await;
            if let Err(second) = export::post_webhook(&self.client, &self.settings, &payload).await
            {
                // Deliberately swallowed; see the module docs.
                warn!(
                    url = %self.settings.url,
                    "webhook delivery failed after retry, dropping row {}: {second}",
                    result.id
                );
            }
        }
        Ok(())
    }
}
