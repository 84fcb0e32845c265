//! Read-model projections served to the front end.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Asset, AssetId, Component, ComponentId, OrderId, OrderStatus, ProcurementOrder, YesNo,
};

/// Availability of a component as displayed to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentStatus {
    /// In stock, nothing pending
    Available,
    /// No units left
    OutOfStock,
    /// Flagged as urgently needed
    Urgent,
    /// A procurement order is open
    OnOrder,
}

impl ComponentStatus {
    /// Derives the status of a component. An open order takes precedence
    /// over urgency, which takes precedence over stock level.
    pub const fn of(component: &Component) -> Self {
        if component.on_order {
            Self::OnOrder
        } else if component.urgent {
            Self::Urgent
        } else if component.total_available == 0 {
            Self::OutOfStock
        } else {
            Self::Available
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Available => "available",
            Self::OutOfStock => "out of stock",
            Self::Urgent => "urgent",
            Self::OnOrder => "on order",
        };
        f.write_str(label)
    }
}

/// An FM1 site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    /// Asset id
    pub id: AssetId,
    /// Site code
    pub site_code: String,
    /// Device type
    pub type_device: String,
    /// Power supply serial number
    pub sn_ps: String,
    /// Version of the asset this row reflects
    pub version: u32,
}

impl From<&Asset> for AssetView {
    fn from(asset: &Asset) -> Self {
        Self {
            id: asset.id,
            site_code: asset.site_code.clone(),
            type_device: asset.device_type.clone(),
            sn_ps: asset.ps_serial.clone(),
            version: asset.version,
        }
    }
}

/// A component row as listed per asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentView {
    /// Component id
    pub id: ComponentId,
    /// Owning asset
    #[serde(rename = "fM1Id")]
    pub asset_id: AssetId,
    /// Product name
    pub product_name: String,
    /// Serial number
    pub sn: String,
    /// Units in stock
    pub total_available: u32,
    /// Urgency flag
    pub urgent_or_not: YesNo,
    /// Order flag
    pub order_or_not: YesNo,
    /// Derived availability
    pub status: ComponentStatus,
    /// Version of the component this row reflects
    pub version: u32,
}

impl From<&Component> for ComponentView {
    fn from(component: &Component) -> Self {
        Self {
            id: component.id,
            asset_id: component.asset_id,
            product_name: component.product_name.clone(),
            sn: component.serial_number.clone(),
            total_available: component.total_available,
            urgent_or_not: component.urgent.into(),
            order_or_not: component.on_order.into(),
            status: ComponentStatus::of(component),
            version: component.version,
        }
    }
}

/// A procurement order as listed per asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    /// Order id
    pub id: OrderId,
    /// Ordered component
    pub component_id: ComponentId,
    /// Asset the component belongs to
    #[serde(rename = "fM1Id")]
    pub asset_id: AssetId,
    /// Requesting expert
    pub expert_id: String,
    /// Reason given by the expert
    pub raison_de_commande: String,
    /// Order status
    pub etat_commande: OrderStatus,
    /// When the order was requested
    pub date_cmd: DateTime<Utc>,
}

impl From<&ProcurementOrder> for OrderView {
    fn from(order: &ProcurementOrder) -> Self {
        Self {
            id: order.id,
            component_id: order.component_id,
            asset_id: order.asset_id,
            expert_id: order.expert_id.clone(),
            raison_de_commande: order.reason.clone(),
            etat_commande: order.status,
            date_cmd: order.requested_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn component(total_available: u32, urgent: bool, on_order: bool) -> Component {
        Component {
            id: ComponentId::new(Uuid::nil()),
            asset_id: AssetId::new(Uuid::nil()),
            product_name: "PSU-12V".to_string(),
            serial_number: "SN001".to_string(),
            total_available,
            urgent,
            on_order,
            version: 1,
        }
    }

    proptest! {
        #[test]
        fn open_orders_always_win(total in 0u32..100, urgent in any::<bool>()) {
            prop_assert_eq!(ComponentStatus::of(&component(total, urgent, true)), ComponentStatus::OnOrder);
        }

        #[test]
        fn stock_level_matters_only_without_flags(total in 0u32..100) {
            let expected = if total == 0 { ComponentStatus::OutOfStock } else { ComponentStatus::Available };
            prop_assert_eq!(ComponentStatus::of(&component(total, false, false)), expected);
        }
    }

    #[test]
    fn component_view_uses_front_end_field_names() {
        let view = ComponentView::from(&component(0, true, false));
        let text = serde_json::to_string_pretty(&view).unwrap();

        insta::assert_snapshot!(text, @r###"
        {
          "id": "00000000-0000-0000-0000-000000000000",
          "fM1Id": "00000000-0000-0000-0000-000000000000",
          "productName": "PSU-12V",
          "sn": "SN001",
          "totalAvailable": 0,
          "urgentOrNot": "Yes",
          "orderOrNot": "No",
          "status": "Urgent",
          "version": 1
        }
        "###);
    }
}
