//! Inventory commands.
//!
//! Field names follow the JSON produced by the front end and the spreadsheet
//! import; the legacy spellings (`fM1Id`, `composentId`, `raisonDeCommande`,
//! ...) are accepted as aliases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockcmd::Command;

use crate::domain::{AssetId, ComponentId, YesNo};

/// Family of component commands, consumed from `gestionfm1.composent.commands`.
pub const COMPONENT_FAMILY: &str = "composent";
/// Family of procurement commands.
pub const PROCUREMENT_FAMILY: &str = "commande";
/// Family of asset commands produced by the FM1 spreadsheet import.
pub const ASSET_FAMILY: &str = "fm1";

/// Every command family handled by this crate.
pub const FAMILIES: [&str; 3] = [COMPONENT_FAMILY, PROCUREMENT_FAMILY, ASSET_FAMILY];

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{field} is required"))
    } else {
        Ok(())
    }
}

/// Adds a component to an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddComponent {
    /// Product name
    pub product_name: String,
    /// Serial number
    pub sn: String,
    /// Units in stock
    #[serde(default)]
    pub total_available: u32,
    /// Urgently needed
    #[serde(default)]
    pub urgent_or_not: YesNo,
    /// Already on order
    #[serde(default)]
    pub order_or_not: YesNo,
    /// Owning asset
    #[serde(alias = "fM1Id")]
    pub asset_id: AssetId,
}

impl Command for AddComponent {
    const COMMAND_TYPE: &'static str = "AddComponent";
    const FAMILY: &'static str = COMPONENT_FAMILY;

    fn validate(&self) -> Result<(), String> {
        require("productName", &self.product_name)?;
        require("sn", &self.sn)
    }
}

/// Raises a procurement order for a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestProcurement {
    /// Component to order
    #[serde(alias = "composentId")]
    pub component_id: ComponentId,
    /// Requesting expert
    pub expert_id: String,
    /// Why the component is needed
    #[serde(alias = "raisonDeCommande")]
    pub reason: String,
    /// Asset the component belongs to
    #[serde(alias = "fM1Id")]
    pub asset_id: AssetId,
    /// When the request was made
    #[serde(alias = "dateCmd")]
    pub requested_at: DateTime<Utc>,
}

impl Command for RequestProcurement {
    const COMMAND_TYPE: &'static str = "RequestProcurement";
    const FAMILY: &'static str = PROCUREMENT_FAMILY;

    fn validate(&self) -> Result<(), String> {
        require("expertId", &self.expert_id)?;
        require("reason", &self.reason)
    }
}

/// Registers (or re-registers) an FM1 site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAsset {
    /// Asset id; registering the same id twice overwrites the site data
    pub asset_id: AssetId,
    /// Site code
    pub site_code: String,
    /// Device type
    #[serde(default, alias = "typeDevice")]
    pub device_type: String,
    /// Power supply serial number
    #[serde(default, alias = "snPs")]
    pub ps_serial: String,
}

impl Command for RegisterAsset {
    const COMMAND_TYPE: &'static str = "RegisterAsset";
    const FAMILY: &'static str = ASSET_FAMILY;

    fn validate(&self) -> Result<(), String> {
        require("siteCode", &self.site_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn add_component_accepts_front_end_payload() {
        let asset = Uuid::now_v7();
        let payload = json!({
            "productName": "PSU-12V",
            "sn": "SN001",
            "totalAvailable": 5,
            "urgentOrNot": "No",
            "orderOrNot": "Yes",
            "fM1Id": asset,
        });

        let command: AddComponent = serde_json::from_value(payload).unwrap();

        assert_eq!(command.asset_id, AssetId::new(asset));
        assert_eq!(command.order_or_not, YesNo::Yes);
        assert_eq!(command.total_available, 5);
        assert!(command.validate().is_ok());
    }

    #[test]
    fn add_component_requires_product_and_serial() {
        let command = AddComponent {
            product_name: "PSU-12V".to_string(),
            sn: " ".to_string(),
            total_available: 1,
            urgent_or_not: YesNo::No,
            order_or_not: YesNo::No,
            asset_id: AssetId::generate(),
        };

        assert_eq!(command.validate(), Err("sn is required".to_string()));
    }

    #[test]
    fn procurement_accepts_legacy_field_names() {
        let payload = json!({
            "etatCommande": "En attente",
            "dateCmd": "2024-05-02T09:30:00Z",
            "composentId": Uuid::now_v7(),
            "expertId": "expert-7",
            "raisonDeCommande": "",
            "fM1Id": Uuid::now_v7(),
        });

        let command: RequestProcurement = serde_json::from_value(payload).unwrap();

        assert_eq!(command.validate(), Err("reason is required".to_string()));
    }

    #[test]
    fn families_route_to_distinct_queues() {
        let naming = stockcmd::QueueNaming::default();
        assert_eq!(
            naming.queue_for::<AddComponent>().unwrap().as_ref(),
            "gestionfm1.composent.commands"
        );
        assert_eq!(
            naming.queue_for::<RequestProcurement>().unwrap().as_ref(),
            "gestionfm1.commande.commands"
        );
        assert_eq!(
            naming.queue_for::<RegisterAsset>().unwrap().as_ref(),
            "gestionfm1.fm1.commands"
        );
    }
}
