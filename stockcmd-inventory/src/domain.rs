//! Write-model entities.
//!
//! Entities are created and mutated only by command handlers. Identifiers of
//! entities created by a command are derived from the command's correlation
//! id, so re-running a command can never mint a second entity.
//!
//! Mutable entities carry a version: 1 when created, incremented by every
//! committed change. The write store refuses a change whose version does not
//! follow the stored one, and the read store keeps the highest version it has
//! seen of each row.

use std::fmt;

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use stockcmd::CorrelationId;
use uuid::Uuid;

const COMPONENT_NAMESPACE: Uuid = Uuid::from_u128(0x5d0c_7e4a_1c3b_4f8e_9a61_0b2f_c4d8_e713);
const ORDER_NAMESPACE: Uuid = Uuid::from_u128(0x8e41_b2d9_6f07_4a35_b1c8_7d93_2e5a_f046);
const SITE_NAMESPACE: Uuid = Uuid::from_u128(0x2b7f_94c1_d35e_4e02_8f6a_51c0_9be3_7d18);

/// Identifier of an FM1 site.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct AssetId(Uuid);

impl AssetId {
    /// A fresh, time-ordered id.
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// The id of the asset installed at `site_code`. Stable across imports.
    pub fn for_site(site_code: &str) -> Self {
        Self::new(Uuid::new_v5(
            &SITE_NAMESPACE,
            site_code.trim().to_uppercase().as_bytes(),
        ))
    }
}

/// Identifier of a component.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct ComponentId(Uuid);

impl ComponentId {
    /// The id of the component created by the command `correlation_id`.
    pub fn for_command(correlation_id: &CorrelationId) -> Self {
        Self::new(Uuid::new_v5(
            &COMPONENT_NAMESPACE,
            correlation_id.as_ref().as_bytes(),
        ))
    }
}

/// Identifier of a procurement order.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct OrderId(Uuid);

impl OrderId {
    /// The id of the order created by the command `correlation_id`.
    pub fn for_command(correlation_id: &CorrelationId) -> Self {
        Self::new(Uuid::new_v5(
            &ORDER_NAMESPACE,
            correlation_id.as_ref().as_bytes(),
        ))
    }
}

/// The `"Yes"`/`"No"` flags used by the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum YesNo {
    /// Flag set
    Yes,
    /// Flag unset
    #[default]
    No,
}

impl From<bool> for YesNo {
    fn from(value: bool) -> Self {
        if value {
            Self::Yes
        } else {
            Self::No
        }
    }
}

impl From<YesNo> for bool {
    fn from(value: YesNo) -> Self {
        value == YesNo::Yes
    }
}

/// An FM1 site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Asset id
    pub id: AssetId,
    /// Site code
    pub site_code: String,
    /// Kind of device installed on the site
    pub device_type: String,
    /// Serial number of the power supply
    pub ps_serial: String,
    /// Committed changes so far
    pub version: u32,
}

/// A spare part attached to an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    /// Component id
    pub id: ComponentId,
    /// Owning asset
    pub asset_id: AssetId,
    /// Product name
    pub product_name: String,
    /// Serial number
    pub serial_number: String,
    /// Units in stock
    pub total_available: u32,
    /// Flagged as urgently needed
    pub urgent: bool,
    /// A procurement order is open for it
    pub on_order: bool,
    /// Committed changes so far
    pub version: u32,
}

/// Version of an entity that does not exist yet.
pub const UNSAVED: u32 = 0;

/// Version the next change to an entity at `current` must carry.
pub const fn next_version(current: u32) -> u32 {
    current.saturating_add(1)
}

/// Lifecycle of a procurement order.
///
/// Orders enter the system as pending; later statuses are set by the
/// purchasing process, which is not driven through this pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Awaiting purchase
    #[serde(rename = "En attente")]
    Pending,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "En attente"),
        }
    }
}

/// A procurement request raised against a component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcurementOrder {
    /// Order id
    pub id: OrderId,
    /// Ordered component
    pub component_id: ComponentId,
    /// Asset the component belongs to
    pub asset_id: AssetId,
    /// Expert who requested the order
    pub expert_id: String,
    /// Why the component is needed
    pub reason: String,
    /// Current status
    pub status: OrderStatus,
    /// When the order was requested
    pub requested_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlation(raw: &str) -> CorrelationId {
        CorrelationId::try_new(raw).unwrap()
    }

    #[test]
    fn derived_ids_are_stable_per_correlation_id() {
        assert_eq!(
            ComponentId::for_command(&correlation("c-1")),
            ComponentId::for_command(&correlation("c-1"))
        );
        assert_ne!(
            ComponentId::for_command(&correlation("c-1")),
            ComponentId::for_command(&correlation("c-2"))
        );
    }

    #[test]
    fn component_and_order_ids_do_not_collide() {
        let component: Uuid = ComponentId::for_command(&correlation("c-1")).into();
        let order: Uuid = OrderId::for_command(&correlation("c-1")).into();
        assert_ne!(component, order);
    }

    #[test]
    fn site_ids_ignore_case_and_padding() {
        assert_eq!(AssetId::for_site(" tun-042 "), AssetId::for_site("TUN-042"));
        assert_ne!(AssetId::for_site("TUN-042"), AssetId::for_site("TUN-043"));
    }

    #[test]
    fn yes_no_flags_use_front_end_spelling() {
        assert_eq!(serde_json::to_string(&YesNo::Yes).unwrap(), "\"Yes\"");
        assert_eq!(serde_json::from_str::<YesNo>("\"No\"").unwrap(), YesNo::No);
        assert!(bool::from(YesNo::from(true)));
    }

    #[test]
    fn pending_orders_serialize_in_french() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::Pending).unwrap(),
            "\"En attente\""
        );
        assert_eq!(OrderStatus::Pending.to_string(), "En attente");
    }
}
