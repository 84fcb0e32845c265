//! Bulk catalogue import.
//!
//! The FM1 spreadsheet is exported as JSON rows. Each row becomes one
//! [`RegisterAsset`] command; the asset id is derived from the site code so
//! importing the same spreadsheet twice updates the existing assets.

use serde::{Deserialize, Serialize};
use stockcmd::{Broker, CommandPublisher, CorrelationId, PublishError};
use tracing::{info, instrument, warn};

use crate::commands::RegisterAsset;
use crate::domain::AssetId;

/// One spreadsheet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogueRow {
    /// Site code
    pub site_code: String,
    /// Device type
    #[serde(alias = "typeDevice")]
    pub device_type: String,
    /// Power supply serial number
    #[serde(alias = "snPs")]
    pub ps_serial: String,
}

impl CatalogueRow {
    /// The command registering this row's asset.
    pub fn to_command(&self) -> RegisterAsset {
        RegisterAsset {
            asset_id: AssetId::for_site(&self.site_code),
            site_code: self.site_code.trim().to_string(),
            device_type: self.device_type.trim().to_string(),
            ps_serial: self.ps_serial.trim().to_string(),
        }
    }
}

/// A row that could not be published.
#[derive(Debug)]
pub struct ImportFailure {
    /// Zero-based row index
    pub row: usize,
    /// Site code of the row
    pub site_code: String,
    /// Why publishing failed
    pub error: PublishError,
}

/// Result of [`CatalogueImport::publish_all`].
#[derive(Debug, Default)]
pub struct ImportReport {
    /// Correlation ids of the published commands, in row order
    pub published: Vec<CorrelationId>,
    /// Rows that were not published
    pub failed: Vec<ImportFailure>,
}

impl ImportReport {
    /// Whether every row was published.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Publishes catalogue rows as commands.
#[derive(Debug, Clone, Default)]
pub struct CatalogueImport {
    rows: Vec<CatalogueRow>,
}

impl CatalogueImport {
    /// An import of `rows`.
    pub fn new(rows: Vec<CatalogueRow>) -> Self {
        Self { rows }
    }

    /// Parses a JSON array of rows.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::from_str(text)?))
    }

    /// Rows to import.
    pub fn rows(&self) -> &[CatalogueRow] {
        &self.rows
    }

    /// Publishes one command per row. A failed row does not stop the import.
    #[instrument(skip_all, fields(rows = self.rows.len()))]
    pub async fn publish_all<B: Broker>(&self, publisher: &CommandPublisher<B>) -> ImportReport {
        let mut report = ImportReport::default();
        for (row, entry) in self.rows.iter().enumerate() {
            match publisher.publish(&entry.to_command()).await {
                Ok(correlation_id) => report.published.push(correlation_id),
                Err(error) => {
                    warn!(row, site_code = %entry.site_code, error = %error, "catalogue row not published");
                    report.failed.push(ImportFailure {
                        row,
                        site_code: entry.site_code.clone(),
                        error,
                    });
                }
            }
        }
        info!(
            published = report.published.len(),
            failed = report.failed.len(),
            "catalogue import finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockcmd::{PublisherConfig, QueueName};
    use stockcmd_memory::InMemoryBroker;

    const SHEET: &str = r#"[
        {"siteCode": "TUN-042", "typeDevice": "FM1", "snPs": "PS-778"},
        {"siteCode": " ", "typeDevice": "FM1", "snPs": "PS-779"},
        {"siteCode": "TUN-043", "deviceType": "FM1", "psSerial": "PS-780"}
    ]"#;

    #[test]
    fn rows_accept_spreadsheet_headers() {
        let import = CatalogueImport::from_json(SHEET).unwrap();

        assert_eq!(import.rows().len(), 3);
        assert_eq!(import.rows()[0].ps_serial, "PS-778");
        assert_eq!(
            import.rows()[2].to_command().asset_id,
            AssetId::for_site("TUN-043")
        );
    }

    #[tokio::test]
    async fn invalid_rows_are_reported_without_stopping_the_import() {
        let broker = InMemoryBroker::new();
        let queue = QueueName::try_new("gestionfm1.fm1.commands").unwrap();
        let publisher = CommandPublisher::new(broker.clone(), PublisherConfig::default());

        let report = CatalogueImport::from_json(SHEET)
            .unwrap()
            .publish_all(&publisher)
            .await;

        assert_eq!(report.published.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].row, 1);
        assert!(matches!(report.failed[0].error, PublishError::Invalid { .. }));
        assert_eq!(broker.ready_count(&queue), 2);
    }
}
