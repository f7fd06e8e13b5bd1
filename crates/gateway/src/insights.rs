//! Derived spend summary for the operator UI: aggregates over one window of
//! a customer's transactions. Purely computational; the handler feeds it a
//! single query result set.

use std::collections::HashMap;

use fraudesk_contracts::Transaction;
use serde::{Deserialize, Serialize};

const TOP_MERCHANT_LIMIT: usize = 10;
const ANOMALY_LIMIT: usize = 5;
const ANOMALY_FACTOR: f64 = 3.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsightsSummary {
    pub window_days: i64,
    pub total_minor: i64,
    pub count: u32,
    pub average_minor: i64,
    pub top_merchants: Vec<MerchantTotal>,
    pub categories: Vec<CategoryBreakdown>,
    pub monthly_trend: Vec<MonthlyTotal>,
    pub anomalies: Vec<Transaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerchantTotal {
    pub merchant: String,
    pub total_minor: i64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryBreakdown {
    pub mcc: String,
    pub name: String,
    pub total_minor: i64,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyTotal {
    pub month: String,
    pub total_minor: i64,
    pub count: u32,
}

fn mcc_name(mcc: &str) -> &'static str {
    match mcc {
        "4111" => "Transit",
        "4814" => "Telecom",
        "5411" => "Grocery",
        "5541" => "Fuel",
        "5651" => "Apparel",
        "5732" => "Electronics",
        "5812" => "Dining",
        "5944" => "Jewelry",
        "6011" => "Cash Withdrawal",
        "7011" => "Lodging",
        _ => "Other",
    }
}

pub fn summarize(transactions: &[Transaction], window_days: i64) -> InsightsSummary {
    let count = transactions.len() as u32;
    let total_minor: i64 = transactions.iter().map(|t| t.amount_minor).sum();
    let average_minor = if count == 0 {
        0
    } else {
        total_minor / count as i64
    };

    let mut by_merchant: HashMap<&str, (i64, u32)> = HashMap::new();
    let mut by_mcc: HashMap<&str, (i64, u32)> = HashMap::new();
    let mut by_month: HashMap<String, (i64, u32)> = HashMap::new();

    for txn in transactions {
        let merchant = by_merchant.entry(txn.merchant.as_str()).or_default();
        merchant.0 += txn.amount_minor;
        merchant.1 += 1;

        let category = by_mcc.entry(txn.mcc.as_str()).or_default();
        category.0 += txn.amount_minor;
        category.1 += 1;

        let month = by_month.entry(txn.ts.format("%Y-%m").to_string()).or_default();
        month.0 += txn.amount_minor;
        month.1 += 1;
    }

    let mut top_merchants: Vec<MerchantTotal> = by_merchant
        .into_iter()
        .map(|(merchant, (total, n))| MerchantTotal {
            merchant: merchant.to_string(),
            total_minor: total,
            count: n,
        })
        .collect();
    top_merchants.sort_by(|a, b| {
        b.total_minor
            .cmp(&a.total_minor)
            .then_with(|| a.merchant.cmp(&b.merchant))
    });
    top_merchants.truncate(TOP_MERCHANT_LIMIT);

    let mut categories: Vec<CategoryBreakdown> = by_mcc
        .into_iter()
        .map(|(mcc, (total, n))| CategoryBreakdown {
            mcc: mcc.to_string(),
            name: mcc_name(mcc).to_string(),
            total_minor: total,
            count: n,
        })
        .collect();
    categories.sort_by(|a, b| {
        b.total_minor
            .cmp(&a.total_minor)
            .then_with(|| a.mcc.cmp(&b.mcc))
    });

    let mut monthly_trend: Vec<MonthlyTotal> = by_month
        .into_iter()
        .map(|(month, (total, n))| MonthlyTotal {
            month,
            total_minor: total,
            count: n,
        })
        .collect();
    monthly_trend.sort_by(|a, b| a.month.cmp(&b.month));

    let threshold = ANOMALY_FACTOR * average_minor as f64;
    let mut anomalies: Vec<Transaction> = transactions
        .iter()
        .filter(|t| count > 0 && (t.amount_minor as f64) > threshold)
        .cloned()
        .collect();
    anomalies.sort_by(|a, b| b.amount_minor.cmp(&a.amount_minor));
    anomalies.truncate(ANOMALY_LIMIT);

    InsightsSummary {
        window_days,
        total_minor,
        count,
        average_minor,
        top_merchants,
        categories,
        monthly_trend,
        anomalies,
    }
}
