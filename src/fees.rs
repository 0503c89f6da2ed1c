use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeHead {
    pub name: String,
    pub amount: f64,
}

pub fn plan_total(heads: &[FeeHead]) -> f64 {
    heads.iter().map(|h| h.amount).sum()
}

/// Number of academic-year months billed through `as_of`, inclusive.
///
/// The academic year starts on the first of `year_start_month`; the year
/// containing `as_of` is the one that began at the most recent occurrence
/// of that month. April start and an as-of date in August bills 5 months
/// (April through August); the answer is always in 1..=12.
pub fn months_billed(year_start_month: u32, as_of: NaiveDate) -> u32 {
    let start = year_start_month.clamp(1, 12);
    let month = as_of.month();
    if month >= start {
        month - start + 1
    } else {
        12 - start + 1 + month
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerTotals {
    pub charged: f64,
    pub paid: f64,
    pub balance: f64,
}

/// Charged = class fee plan + transport monthly fee for each billed month.
/// Balance keeps its sign; an advance payment shows up as negative.
pub fn ledger_totals(
    plan_total: f64,
    transport_monthly: f64,
    months: u32,
    payments: &[f64],
) -> LedgerTotals {
    let charged = plan_total + transport_monthly * months as f64;
    let paid: f64 = payments.iter().sum();
    LedgerTotals {
        charged: round2(charged),
        paid: round2(paid),
        balance: round2(charged - paid),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaulterRow {
    pub student_id: String,
    pub student_name: String,
    pub class_id: String,
    pub class_name: String,
    pub roll_no: u32,
    pub charged: f64,
    pub paid: f64,
    pub balance: f64,
}

/// Keep only students who still owe money, worst first; ties fall back to
/// roll order so the list reads like the register.
pub fn rank_defaulters(mut rows: Vec<DefaulterRow>) -> Vec<DefaulterRow> {
    rows.retain(|r| r.balance > 0.005);
    rows.sort_by(|a, b| {
        b.balance
            .partial_cmp(&a.balance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.class_name.cmp(&b.class_name))
            .then_with(|| a.roll_no.cmp(&b.roll_no))
    });
    rows
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
