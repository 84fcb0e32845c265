//! Operator subcommands: dead-letter inspection and catalogue import.

use std::path::Path;

use serde_json::{json, Value};
use stockcmd::{Broker, CommandPublisher, DeadLetterEntry, DeadLetterInspector, QueueNaming};
use stockcmd_inventory::{CatalogueImport, ImportReport, FAMILIES};
use tracing::{info, warn};

use crate::errors::{ServiceError, ServiceResult};

/// Dead letters of `family`, oldest first, one JSON object each.
pub async fn dead_letter_report<I: DeadLetterInspector>(
    inspector: &I,
    naming: &QueueNaming,
    family: &str,
) -> ServiceResult<Vec<Value>> {
    if !FAMILIES.iter().any(|known| *known == family) {
        return Err(ServiceError::UnknownFamily(family.to_string()));
    }
    let queue = naming.queue_for_family(family)?;
    let entries = inspector.dead_letters(&queue).await?;
    Ok(entries.iter().map(describe).collect())
}

// Poison messages have no envelope; their raw body is shown instead.
fn describe(entry: &DeadLetterEntry) -> Value {
    let envelope = entry.envelope().ok();
    json!({
        "deadLetteredAt": entry.dead_lettered_at,
        "originalQueue": entry.original_queue.to_string(),
        "deliveryCount": u32::from(entry.delivery_count),
        "reason": entry.reason,
        "commandType": envelope.as_ref().map(|envelope| envelope.command_type().to_string()),
        "correlationId": envelope.as_ref().map(|envelope| envelope.correlation_id().to_string()),
        "body": envelope
            .is_none()
            .then(|| String::from_utf8_lossy(&entry.body).into_owned()),
    })
}

/// Publishes every row of a catalogue export.
pub async fn import_catalogue<B: Broker>(
    publisher: &CommandPublisher<B>,
    path: &Path,
) -> ServiceResult<ImportReport> {
    let text = std::fs::read_to_string(path).map_err(|source| ServiceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let import = CatalogueImport::from_json(&text).map_err(|source| ServiceError::Catalogue {
        path: path.to_path_buf(),
        source,
    })?;

    let report = import.publish_all(publisher).await;
    info!(
        published = report.published.len(),
        failed = report.failed.len(),
        "catalogue import finished"
    );
    if report.is_complete() {
        return Ok(report);
    }
    for failure in &report.failed {
        warn!(row = failure.row, site_code = %failure.site_code, error = %failure.error, "row not published");
    }
    Err(ServiceError::IncompleteImport {
        failed: report.failed.len(),
        total: import.rows().len(),
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use futures::StreamExt;
    use stockcmd::{
        BrokerConnection, Channel, Disposition, OutboundMessage, PublisherConfig,
        QueueDeclaration,
    };
    use stockcmd_memory::InMemoryBroker;

    use super::*;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{name}-{}.json", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn poison_messages_are_listed_with_their_raw_body() {
        let broker = InMemoryBroker::new();
        let naming = QueueNaming::default();
        let queue = naming.queue_for_family("composent").unwrap();
        let connection = broker.connect().await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel
            .declare_queue(&QueueDeclaration::dead_letter_queue(&queue).unwrap())
            .await
            .unwrap();
        channel
            .declare_queue(&QueueDeclaration::command_queue(queue.clone()).unwrap())
            .await
            .unwrap();
        channel
            .publish(
                &queue,
                OutboundMessage {
                    body: b"{not json".to_vec(),
                    correlation_id: None,
                },
            )
            .await
            .unwrap();
        let mut deliveries = channel.consume(&queue).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel
            .nack(
                delivery.tag,
                Disposition::DeadLetter {
                    reason: "malformed envelope".to_string(),
                },
            )
            .await
            .unwrap();

        let report = dead_letter_report(&broker, &naming, "composent").await.unwrap();

        assert_eq!(report.len(), 1);
        assert_eq!(report[0]["reason"], "malformed envelope");
        assert_eq!(report[0]["body"], "{not json");
        assert_eq!(report[0]["commandType"], Value::Null);
        assert_eq!(report[0]["originalQueue"], "gestionfm1.composent.commands");
    }

    #[tokio::test]
    async fn unknown_family_is_refused() {
        let result =
            dead_letter_report(&InMemoryBroker::new(), &QueueNaming::default(), "stock").await;

        assert!(matches!(result, Err(ServiceError::UnknownFamily(family)) if family == "stock"));
    }

    #[tokio::test]
    async fn catalogue_rows_are_published_to_the_asset_queue() {
        let broker = InMemoryBroker::new();
        let publisher = CommandPublisher::new(broker.clone(), PublisherConfig::default());
        let path = scratch_file(
            "stockcmd-catalogue",
            r#"[
                {"siteCode": "TUN-001", "typeDevice": "FM1", "snPs": "PS-1"},
                {"siteCode": "TUN-002", "typeDevice": "FM1", "snPs": "PS-2"}
            ]"#,
        );

        let report = import_catalogue(&publisher, &path).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(report.published.len(), 2);
        let queue = QueueNaming::default().queue_for_family("fm1").unwrap();
        assert_eq!(broker.ready_count(&queue), 2);
    }

    #[tokio::test]
    async fn incomplete_imports_are_errors() {
        let publisher = CommandPublisher::new(InMemoryBroker::new(), PublisherConfig::default());
        let path = scratch_file(
            "stockcmd-catalogue-blank",
            r#"[
                {"siteCode": "", "typeDevice": "FM1", "snPs": "PS-1"},
                {"siteCode": "TUN-002", "typeDevice": "FM1", "snPs": "PS-2"}
            ]"#,
        );

        let result = import_catalogue(&publisher, &path).await;
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            result,
            Err(ServiceError::IncompleteImport { failed: 1, total: 2 })
        ));
    }

    #[tokio::test]
    async fn unreadable_exports_name_the_file() {
        let publisher = CommandPublisher::new(InMemoryBroker::new(), PublisherConfig::default());
        let path = scratch_file("stockcmd-catalogue-garbled", "siteCode;typeDevice");

        let result = import_catalogue(&publisher, &path).await;
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ServiceError::Catalogue { path: failed, .. }) if failed == path));
    }
}
