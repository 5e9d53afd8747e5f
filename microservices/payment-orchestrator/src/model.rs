//! Payment domain types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tiba_core::PhoneNumber;
use uuid::Uuid;

/// Payment rail a charge is routed through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rail {
    /// Push-payment to the payer's handset (M-Pesa STK push)
    MobileMoney,
    /// Hosted card/wallet checkout the payer is redirected to (Pesapal)
    CardRedirect,
    /// Settlement on a blockchain ledger (Stellar)
    Ledger,
}

impl Rail {
    pub const ALL: [Rail; 3] = [Rail::MobileMoney, Rail::CardRedirect, Rail::Ledger];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rail::MobileMoney => "mobile_money",
            Rail::CardRedirect => "card_redirect",
            Rail::Ledger => "ledger",
        }
    }
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Rail {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile_money" | "mpesa" => Ok(Rail::MobileMoney),
            "card_redirect" | "pesapal" => Ok(Rail::CardRedirect),
            "ledger" | "stellar" => Ok(Rail::Ledger),
            other => Err(format!("unknown rail: {other}")),
        }
    }
}

/// Kind of marketplace entity a payment settles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayableType {
    LabAppointment,
    Appointment,
    MedicineOrder,
    NursingService,
}

impl PayableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayableType::LabAppointment => "lab_appointment",
            PayableType::Appointment => "appointment",
            PayableType::MedicineOrder => "medicine_order",
            PayableType::NursingService => "nursing_service",
        }
    }

    /// Leading segment of merchant references for this payable kind
    pub fn reference_prefix(&self) -> &'static str {
        match self {
            PayableType::LabAppointment => "LAB",
            PayableType::Appointment => "APT",
            PayableType::MedicineOrder => "MED",
            PayableType::NursingService => "NRS",
        }
    }
}

impl fmt::Display for PayableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayableType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lab_appointment" => Ok(PayableType::LabAppointment),
            "appointment" => Ok(PayableType::Appointment),
            "medicine_order" => Ok(PayableType::MedicineOrder),
            "nursing_service" => Ok(PayableType::NursingService),
            other => Err(format!("unknown payable type: {other}")),
        }
    }
}

/// Reference to the order/appointment being paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayableRef {
    pub payable_type: PayableType,
    pub payable_id: i64,
}

impl PayableRef {
    pub fn new(payable_type: PayableType, payable_id: i64) -> Self {
        Self { payable_type, payable_id }
    }
}

impl fmt::Display for PayableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.payable_type, self.payable_id)
    }
}

/// Lifecycle of a payment intent.
///
/// `Created` and `Submitted` only exist while the initiate call is in flight.
/// `Succeeded`, `Failed`, `Cancelled` and `Refunded` are terminal; the only
/// transition out of a terminal state is `Succeeded -> Refunded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Created,
    Submitted,
    Pending,
    Succeeded,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub const ACTIVE: [PaymentStatus; 3] = [
        PaymentStatus::Created,
        PaymentStatus::Submitted,
        PaymentStatus::Pending,
    ];

    pub fn is_terminal(&self) -> bool {
        !Self::ACTIVE.contains(self)
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Created, Submitted | Failed | Cancelled)
                | (Submitted, Pending | Failed | Cancelled)
                | (Pending, Pending | Succeeded | Failed | Cancelled)
                | (Succeeded, Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Created => "CREATED",
            PaymentStatus::Submitted => "SUBMITTED",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Succeeded => "SUCCEEDED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(PaymentStatus::Created),
            "SUBMITTED" => Ok(PaymentStatus::Submitted),
            "PENDING" => Ok(PaymentStatus::Pending),
            "SUCCEEDED" => Ok(PaymentStatus::Succeeded),
            "FAILED" => Ok(PaymentStatus::Failed),
            "CANCELLED" => Ok(PaymentStatus::Cancelled),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

/// A single attempt to collect money for a payable.
///
/// `merchant_reference` is the idempotency key sent to the rail and is unique
/// across all intents; a retry after failure is a new intent with a new reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: Uuid,
    pub payable_type: PayableType,
    pub payable_id: i64,
    pub payer_id: i64,
    pub amount: Decimal,
    pub currency: String,
    pub rail: Rail,
    pub merchant_reference: String,
    pub external_tracking_id: Option<String>,
    pub status: PaymentStatus,
    pub status_reason: Option<String>,
    /// Amount in the settlement asset, for ledger payments
    pub settlement_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentIntent {
    pub fn new(request: &ChargeRequest, merchant_reference: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payable_type: request.payable.payable_type,
            payable_id: request.payable.payable_id,
            payer_id: request.payer.id,
            amount: request.amount,
            currency: request.currency.clone(),
            rail: request.rail,
            merchant_reference,
            external_tracking_id: None,
            status: PaymentStatus::Created,
            status_reason: None,
            settlement_amount: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn payable(&self) -> PayableRef {
        PayableRef::new(self.payable_type, self.payable_id)
    }

    /// Copy of this intent moved to `next`; the caller persists it conditionally
    pub fn transitioned(&self, next: PaymentStatus, reason: Option<String>) -> Self {
        let mut updated = self.clone();
        updated.status = next;
        if reason.is_some() {
            updated.status_reason = reason;
        }
        updated.updated_at = Utc::now();
        updated
    }
}

/// Build the merchant reference `{prefix}-{entity}-{payer}-{unix}`
pub fn merchant_reference(prefix: &str, entity_id: i64, payer_id: i64, unix_time: i64) -> String {
    format!("{prefix}-{entity_id}-{payer_id}-{unix_time}")
}

/// Who pays, and how the rail can reach them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payer {
    pub id: i64,
    pub phone: Option<PhoneNumber>,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Destination wallet for ledger payouts that are payer-specific
    pub ledger_address: Option<String>,
}

/// Inbound request to collect money for a payable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub payable: PayableRef,
    /// The provider (lab, doctor, pharmacy) the payable belongs to
    pub provider_id: i64,
    pub payer: Payer,
    pub amount: Decimal,
    pub currency: String,
    pub rail: Rail,
    pub description: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// What the payer has to do next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NextAction {
    /// Send the payer's browser to a hosted checkout page
    Redirect { url: String },
    /// The payer confirms on their handset
    Prompt { message: String },
    /// The ledger transaction was submitted; nothing for the payer to do
    None,
}

/// Tracking handle returned to the caller of `charge`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentHandle {
    pub intent_id: Uuid,
    pub merchant_reference: String,
    pub external_tracking_id: String,
    pub rail: Rail,
    pub status: PaymentStatus,
    pub next_action: NextAction,
}

/// Status as reported by a rail, before classification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RailStatus {
    /// Numeric result code (mobile money)
    ResultCode { code: i64, description: Option<String> },
    /// Textual status description (card redirect)
    Description { value: String },
    /// Ledger transaction lookup result
    Ledger { verified: bool, successful: bool },
    /// The rail says the request is still being processed
    Processing,
}

/// Classification of a rail status against the intent state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
    /// Not classifiable as terminal; the intent stays pending
    Unresolved,
}

impl Outcome {
    pub fn target_status(&self) -> Option<PaymentStatus> {
        match self {
            Outcome::Succeeded => Some(PaymentStatus::Succeeded),
            Outcome::Failed => Some(PaymentStatus::Failed),
            Outcome::Cancelled => Some(PaymentStatus::Cancelled),
            Outcome::Unresolved => None,
        }
    }
}

/// Where a status update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Callback,
    Poll,
    /// Cancellation or refund requested through the API
    Operator,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::Callback => "callback",
            UpdateSource::Poll => "poll",
            UpdateSource::Operator => "operator",
        }
    }
}

/// A rail status observation to apply to an intent
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub rail: Rail,
    pub external_tracking_id: String,
    pub status: RailStatus,
    pub raw: serde_json::Value,
    pub source: UpdateSource,
}

/// Append-only audit record of every observed notification or poll result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEvent {
    pub id: Uuid,
    pub rail: Rail,
    pub external_tracking_id: String,
    pub source: UpdateSource,
    pub raw_payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    /// Whether this event caused a state transition
    pub applied: bool,
    pub note: Option<String>,
}

impl CallbackEvent {
    pub fn record(update: &StatusUpdate, applied: bool, note: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            rail: update.rail,
            external_tracking_id: update.external_tracking_id.clone(),
            source: update.source,
            raw_payload: update.raw.clone(),
            received_at: Utc::now(),
            applied,
            note,
        }
    }
}

/// Result of applying a status update
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied { from: PaymentStatus, to: PaymentStatus },
    /// Intent was already terminal; recorded as a no-op
    AlreadyTerminal(PaymentStatus),
    /// Status not classifiable; intent left pending
    Unresolved,
    /// No intent carries this tracking id
    Orphan,
}
