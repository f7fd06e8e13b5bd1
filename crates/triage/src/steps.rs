//! Pure cores of the pipeline steps: aggregation over recent activity,
//! signal derivation and the final decision mapping. Everything here is
//! deterministic given its inputs; I/O and retries live in the orchestrator.

use std::collections::HashSet;

use fraudesk_contracts::{
    ActivitySummary, Decision, ProfileSummary, Recommendation, Risk, SignalSet, Transaction,
};

pub const STEP_GET_PROFILE: &str = "get_profile";
pub const STEP_RECENT_TRANSACTIONS: &str = "recent_transactions";
pub const STEP_RISK_SIGNALS: &str = "risk_signals";
pub const STEP_RISK_SIGNALS_FALLBACK: &str = "risk_signals_fallback";
pub const STEP_KB_LOOKUP: &str = "kb_lookup";
pub const STEP_DECIDE: &str = "decide";

pub const SIGNAL_HIGH_VELOCITY: &str = "high_velocity";
pub const SIGNAL_LARGE_AMOUNT: &str = "large_amount";
pub const SIGNAL_FOREIGN_TRANSACTION: &str = "foreign_transaction";
pub const SIGNAL_MERCHANT_CONCENTRATION: &str = "merchant_concentration";
pub const SIGNAL_SERVICE_UNAVAILABLE: &str = "service_unavailable";
pub const REASON_NO_CLEAR_RISK: &str = "no_clear_risk";

pub const HOME_COUNTRY: &str = "IN";

const HIGH_VELOCITY_TXN_COUNT: u32 = 15;
const LARGE_AMOUNT_MINOR: i64 = 50_000;
const CONCENTRATION_MAX_UNIQUE_MERCHANTS: u32 = 3;
const CONCENTRATION_MIN_TXN_COUNT: u32 = 10;
const SCORE_PER_SIGNAL: f64 = 0.25;
pub const FALLBACK_SCORE: f64 = 0.5;

const HIGH_SCORE_THRESHOLD: f64 = 0.6;
const MEDIUM_SCORE_THRESHOLD: f64 = 0.3;
const HIGH_CONFIDENCE: f64 = 0.92;
const MEDIUM_CONFIDENCE: f64 = 0.78;
const LOW_CONFIDENCE: f64 = 0.65;

pub use fraudesk_contracts::OTP_KYC_LEVEL;

pub fn summarize_activity(transactions: &[Transaction]) -> ActivitySummary {
    let count = transactions.len() as u32;
    let total_minor: i64 = transactions.iter().map(|t| t.amount_minor).sum();
    let unique_merchants = transactions
        .iter()
        .map(|t| t.merchant.as_str())
        .collect::<HashSet<_>>()
        .len() as u32;
    let average_minor = if count == 0 {
        0
    } else {
        total_minor / count as i64
    };

    ActivitySummary {
        count,
        total_minor,
        unique_merchants,
        average_minor,
    }
}

pub fn derive_signals(profile: &ProfileSummary, activity: &ActivitySummary) -> SignalSet {
    let mut signals = Vec::new();

    if activity.count > HIGH_VELOCITY_TXN_COUNT {
        signals.push(SIGNAL_HIGH_VELOCITY.to_string());
    }

    if let Some(suspect) = &profile.suspect {
        if suspect.amount_minor > LARGE_AMOUNT_MINOR {
            signals.push(SIGNAL_LARGE_AMOUNT.to_string());
        }
        if suspect.country != HOME_COUNTRY {
            signals.push(SIGNAL_FOREIGN_TRANSACTION.to_string());
        }
    }

    if activity.unique_merchants < CONCENTRATION_MAX_UNIQUE_MERCHANTS
        && activity.count > CONCENTRATION_MIN_TXN_COUNT
    {
        signals.push(SIGNAL_MERCHANT_CONCENTRATION.to_string());
    }

    let score = (SCORE_PER_SIGNAL * signals.len() as f64).min(1.0);

    SignalSet {
        signals,
        score,
        fallback: false,
    }
}

pub fn fallback_signals() -> SignalSet {
    SignalSet {
        signals: vec![SIGNAL_SERVICE_UNAVAILABLE.to_string()],
        score: FALLBACK_SCORE,
        fallback: true,
    }
}

pub fn decide(signals: &SignalSet, kyc_level: i16) -> Decision {
    let (risk, recommendation, confidence) = if signals.score >= HIGH_SCORE_THRESHOLD {
        (Risk::High, Recommendation::FreezeCard, HIGH_CONFIDENCE)
    } else if signals.score >= MEDIUM_SCORE_THRESHOLD {
        (
            Risk::Medium,
            Recommendation::ContactCustomer,
            MEDIUM_CONFIDENCE,
        )
    } else {
        (
            Risk::Low,
            Recommendation::MarkFalsePositive,
            LOW_CONFIDENCE,
        )
    };

    let reasons = if signals.signals.is_empty() {
        vec![REASON_NO_CLEAR_RISK.to_string()]
    } else {
        signals.signals.clone()
    };

    Decision {
        risk,
        recommendation,
        confidence,
        reasons,
        requires_otp: risk == Risk::High && kyc_level >= OTP_KYC_LEVEL,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fraudesk_contracts::SuspectTransaction;

    fn txn(id: &str, merchant: &str, amount: i64) -> Transaction {
        Transaction {
            id: id.to_string(),
            customer_id: "cus_1".to_string(),
            card_id: "card_1".to_string(),
            ts: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            amount_minor: amount,
            merchant: merchant.to_string(),
            mcc: "5411".to_string(),
            currency: "INR".to_string(),
            device_id: None,
            city: None,
            country: "IN".to_string(),
            status: "settled".to_string(),
        }
    }

    fn profile(suspect: Option<SuspectTransaction>) -> ProfileSummary {
        ProfileSummary {
            alert_id: "alert_1".to_string(),
            alert_risk: Risk::Medium,
            alert_reason: "velocity".to_string(),
            customer_id: "cus_1".to_string(),
            customer_name: "Asha Rao".to_string(),
            kyc_level: 2,
            card_count: 1,
            account_balance_minor: 100_000,
            suspect,
        }
    }

    #[test]
    fn activity_summary_aggregates() {
        let txns = vec![
            txn("t1", "Grocer", 100),
            txn("t2", "Grocer", 300),
            txn("t3", "Cafe", 200),
        ];
        let summary = summarize_activity(&txns);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.total_minor, 600);
        assert_eq!(summary.unique_merchants, 2);
        assert_eq!(summary.average_minor, 200);
    }

    #[test]
    fn empty_activity_averages_zero() {
        let summary = summarize_activity(&[]);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.average_minor, 0);
    }

    #[test]
    fn high_velocity_foreign_large_amount_yields_high_risk() {
        let txns: Vec<Transaction> = (0..18)
            .map(|i| txn(&format!("t{i}"), &format!("m{}", i % 5), 1_000))
            .collect();
        let activity = summarize_activity(&txns);
        let profile = profile(Some(SuspectTransaction {
            txn_id: "t_suspect".to_string(),
            amount_minor: 499_900,
            merchant: "Luxury Goods".to_string(),
            country: "US".to_string(),
        }));

        let signals = derive_signals(&profile, &activity);
        assert!(signals.signals.contains(&SIGNAL_HIGH_VELOCITY.to_string()));
        assert!(signals.signals.contains(&SIGNAL_LARGE_AMOUNT.to_string()));
        assert!(
            signals
                .signals
                .contains(&SIGNAL_FOREIGN_TRANSACTION.to_string())
        );
        assert_eq!(signals.score, 0.75);

        let decision = decide(&signals, 2);
        assert_eq!(decision.risk, Risk::High);
        assert_eq!(decision.recommendation, Recommendation::FreezeCard);
        assert_eq!(decision.confidence, 0.92);
        assert!(!decision.requires_otp);
    }

    #[test]
    fn merchant_concentration_needs_both_thresholds() {
        let concentrated: Vec<Transaction> =
            (0..12).map(|i| txn(&format!("t{i}"), "OnlyShop", 100)).collect();
        let activity = summarize_activity(&concentrated);
        let signals = derive_signals(&profile(None), &activity);
        assert!(
            signals
                .signals
                .contains(&SIGNAL_MERCHANT_CONCENTRATION.to_string())
        );

        let sparse: Vec<Transaction> =
            (0..8).map(|i| txn(&format!("t{i}"), "OnlyShop", 100)).collect();
        let activity = summarize_activity(&sparse);
        let signals = derive_signals(&profile(None), &activity);
        assert!(
            !signals
                .signals
                .contains(&SIGNAL_MERCHANT_CONCENTRATION.to_string())
        );
    }

    #[test]
    fn quiet_profile_scores_low_with_default_reason() {
        let activity = summarize_activity(&[txn("t1", "Grocer", 100)]);
        let signals = derive_signals(&profile(None), &activity);
        assert!(signals.signals.is_empty());
        assert_eq!(signals.score, 0.0);

        let decision = decide(&signals, 1);
        assert_eq!(decision.risk, Risk::Low);
        assert_eq!(decision.recommendation, Recommendation::MarkFalsePositive);
        assert_eq!(decision.confidence, 0.65);
        assert_eq!(decision.reasons, vec![REASON_NO_CLEAR_RISK.to_string()]);
    }

    #[test]
    fn score_caps_at_one() {
        let set = SignalSet {
            signals: (0..6).map(|i| format!("s{i}")).collect(),
            score: (SCORE_PER_SIGNAL * 6.0).min(1.0),
            fallback: false,
        };
        assert_eq!(set.score, 1.0);
    }

    #[test]
    fn fallback_score_maps_to_medium() {
        let decision = decide(&fallback_signals(), 3);
        assert_eq!(decision.risk, Risk::Medium);
        assert_eq!(decision.recommendation, Recommendation::ContactCustomer);
        assert_eq!(
            decision.reasons,
            vec![SIGNAL_SERVICE_UNAVAILABLE.to_string()]
        );
        assert!(!decision.requires_otp);
    }

    #[test]
    fn otp_required_only_for_high_risk_and_high_kyc() {
        let high = SignalSet {
            signals: vec![
                SIGNAL_HIGH_VELOCITY.to_string(),
                SIGNAL_LARGE_AMOUNT.to_string(),
                SIGNAL_FOREIGN_TRANSACTION.to_string(),
            ],
            score: 0.75,
            fallback: false,
        };
        assert!(decide(&high, 3).requires_otp);
        assert!(!decide(&high, 2).requires_otp);
    }
}
