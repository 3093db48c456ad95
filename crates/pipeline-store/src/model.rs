use chrono::{DateTime, Utc};
use pipeline_types::{Offer, OfferId, OfferPhaseChange, Project, ProjectId, WinningOffer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A fully validated offer win, applied in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferWin {
    pub offer_id: OfferId,
    /// Phase change for the winner. Applied only while the offer is `sent`.
    pub change: OfferPhaseChange,
    /// The project the offer was linked to when the win was prepared. A
    /// relinked offer fails the win with `Conflict`.
    pub project: Option<ProjectWin>,
}

/// The project side of a win.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectWin {
    pub project_id: ProjectId,
    pub adoption: WinningOffer,
}

/// What a committed win changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinReceipt {
    pub offer: Offer,
    pub project: Option<Project>,
    pub expired_siblings: Vec<OfferId>,
}

/// Pricing columns of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPricing {
    pub value: Decimal,
    pub cost: Decimal,
    pub probability: u8,
    pub updated_at: DateTime<Utc>,
}
