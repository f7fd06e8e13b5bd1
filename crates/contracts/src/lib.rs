use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cursor;

/// KYC tier at which destructive actions demand an OTP. Shared by the
/// decision step and the freeze-card policy gate so the two can never
/// disagree.
pub const OTP_KYC_LEVEL: i16 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn as_str(self) -> &'static str {
        match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    FreezeCard,
    ContactCustomer,
    MarkFalsePositive,
}

impl Recommendation {
    pub fn as_str(self) -> &'static str {
        match self {
            Recommendation::FreezeCard => "freeze_card",
            Recommendation::ContactCustomer => "contact_customer",
            Recommendation::MarkFalsePositive => "mark_false_positive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardNetwork {
    Visa,
    Mastercard,
    Rupay,
}

impl CardNetwork {
    pub fn as_str(self) -> &'static str {
        match self {
            CardNetwork::Visa => "visa",
            CardNetwork::Mastercard => "mastercard",
            CardNetwork::Rupay => "rupay",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Active,
    Frozen,
    Blocked,
}

impl CardStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CardStatus::Active => "active",
            CardStatus::Frozen => "frozen",
            CardStatus::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    FalsePositive,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::FalsePositive => "false_positive",
            AlertStatus::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    CardFreeze,
    Dispute,
    FalsePositive,
}

impl CaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseType::CardFreeze => "card_freeze",
            CaseType::Dispute => "dispute",
            CaseType::FalsePositive => "false_positive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Open,
    Investigating,
    Completed,
    Closed,
}

impl CaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Open => "open",
            CaseStatus::Investigating => "investigating",
            CaseStatus::Completed => "completed",
            CaseStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// Error returned when a persisted tag does not map back onto its enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagError {
    pub value: String,
}

impl std::fmt::Display for TagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown tag value: {}", self.value)
    }
}

impl std::error::Error for TagError {}

macro_rules! impl_from_str {
    ($ty:ident { $($tag:literal => $variant:ident),+ $(,)? }) => {
        impl std::str::FromStr for $ty {
            type Err = TagError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($tag => Ok($ty::$variant),)+
                    other => Err(TagError {
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

impl_from_str!(Risk { "low" => Low, "medium" => Medium, "high" => High });
impl_from_str!(Recommendation {
    "freeze_card" => FreezeCard,
    "contact_customer" => ContactCustomer,
    "mark_false_positive" => MarkFalsePositive,
});
impl_from_str!(CardNetwork { "visa" => Visa, "mastercard" => Mastercard, "rupay" => Rupay });
impl_from_str!(CardStatus { "active" => Active, "frozen" => Frozen, "blocked" => Blocked });
impl_from_str!(AlertStatus {
    "open" => Open,
    "false_positive" => FalsePositive,
    "resolved" => Resolved,
});
impl_from_str!(CaseType {
    "card_freeze" => CardFreeze,
    "dispute" => Dispute,
    "false_positive" => FalsePositive,
});
impl_from_str!(CaseStatus {
    "open" => Open,
    "investigating" => Investigating,
    "completed" => Completed,
    "closed" => Closed,
});
impl_from_str!(RunStatus { "completed" => Completed, "failed" => Failed });

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub phone: String,
    pub kyc_level: i16,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub id: String,
    pub customer_id: String,
    pub last_four: String,
    pub network: CardNetwork,
    pub status: CardStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    pub customer_id: String,
    pub balance_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub customer_id: String,
    pub card_id: String,
    pub ts: DateTime<Utc>,
    pub amount_minor: i64,
    pub merchant: String,
    pub mcc: String,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub city: Option<String>,
    pub country: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transaction_id: Option<String>,
    pub risk: Risk,
    pub status: AlertStatus,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Minimal customer embed for alert listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    #[serde(flatten)]
    pub alert: Alert,
    pub customer: CustomerRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Case {
    pub id: String,
    pub customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub transaction_id: Option<String>,
    pub case_type: CaseType,
    pub status: CaseStatus,
    pub reason_code: String,
    pub created_at: DateTime<Utc>,
}

/// One row of the audit ledger. Never updated, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseEvent {
    pub id: String,
    pub case_id: String,
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbDoc {
    pub id: String,
    pub title: String,
    pub body: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    #[serde(flatten)]
    pub customer: Customer,
    pub cards: Vec<Card>,
    pub accounts: Vec<Account>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageRunRecord {
    pub id: String,
    pub alert_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub risk: Option<Risk>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub recommendation: Option<Recommendation>,
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub confidence: Option<f64>,
    pub fallback_used: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub total_duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspectTransaction {
    pub txn_id: String,
    pub amount_minor: i64,
    pub merchant: String,
    pub country: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub alert_id: String,
    pub alert_risk: Risk,
    pub alert_reason: String,
    pub customer_id: String,
    pub customer_name: String,
    pub kyc_level: i16,
    pub card_count: i64,
    pub account_balance_minor: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub suspect: Option<SuspectTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub count: u32,
    pub total_minor: i64,
    pub unique_merchants: u32,
    pub average_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalSet {
    pub signals: Vec<String>,
    pub score: f64,
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbDocRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KbExcerpts {
    pub docs: Vec<KbDocRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub risk: Risk,
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub reasons: Vec<String>,
    pub requires_otp: bool,
}

/// Closed sum of per-step outputs. The persistence layer serializes the
/// variant to JSON at write time only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepResult {
    Profile(ProfileSummary),
    RecentActivity(ActivitySummary),
    RiskSignals(SignalSet),
    KbLookup(KbExcerpts),
    Decision(Decision),
}

/// One pipeline attempt, successful or not. Failed attempts keep their slot
/// in the trace so the sequence records what actually happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStep {
    pub name: String,
    pub ok: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageResult {
    pub risk: Risk,
    pub recommendation: Recommendation,
    pub reasons: Vec<String>,
    pub confidence: f64,
    pub requires_otp: bool,
    pub fallback_used: bool,
    pub total_duration_ms: u64,
    pub steps: Vec<AgentStep>,
}

/// Everything a triage run can put on its per-run channel. Subscribers
/// pattern-match; `Complete` and `Error` are terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum TriageEvent {
    Connected { run_id: String },
    Start { run_id: String, alert_id: String },
    Step(AgentStep),
    Retry { step: String, attempt: u32 },
    Fallback { step: String, last_error: String },
    Complete { result: TriageResult },
    Error { message: String },
}

impl TriageEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TriageEvent::Complete { .. } | TriageEvent::Error { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TriageEvent::Connected { .. } => "connected",
            TriageEvent::Start { .. } => "start",
            TriageEvent::Step(_) => "step",
            TriageEvent::Retry { .. } => "retry",
            TriageEvent::Fallback { .. } => "fallback",
            TriageEvent::Complete { .. } => "complete",
            TriageEvent::Error { .. } => "error",
        }
    }
}
