//! Simulated escrow payments.
//!
//! A client opens an intent for the accepted bid, pays it with a card (only the
//! brand and last four digits are kept), and the funds sit in `held` until the
//! client releases them, which also completes the project.

use crate::common::models::{from_millis, now_millis, NotificationKind, Payment, PaymentStatus, ProjectStatus};
use crate::server::auth::AuthUser;
use crate::server::database::Database;
use crate::server::error::{is_unique_violation, AppError, AppResult};
use crate::server::notifications;
use crate::server::projects;
use crate::server::state::AppState;
use crate::server::validation::{require_id, rule, Check, Rule, Validate};
use chrono::Datelike;
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateIntentRequest {
    pub project_id: String,
    pub bid_id: String,
    pub amount: f64,
}

impl Validate for CreateIntentRequest {
    const RULES: &'static [Rule] = &[
        rule("projectId", Check::Required, "Project ID is required"),
        rule("bidId", Check::Required, "Bid ID is required"),
        rule("amount", Check::Numeric, "Amount must be a number"),
        rule("amount", Check::Positive, "Amount must be greater than 0"),
    ];
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPaymentRequest {
    pub payment_intent_id: String,
    pub card_number: String,
    pub expiry_date: String,
    pub cvc: String,
    pub name: String,
}

impl Validate for ProcessPaymentRequest {
    const RULES: &'static [Rule] = &[
        rule("paymentIntentId", Check::Required, "Payment intent ID is required"),
        rule("cardNumber", Check::Required, "Card number is required"),
        rule("cardNumber", Check::Digits(16, 16), "Invalid card number"),
        rule("expiryDate", Check::Required, "Expiry date is required"),
        rule("expiryDate", Check::Expiry, "Invalid format (MM/YY)"),
        rule("cvc", Check::Required, "CVC is required"),
        rule("cvc", Check::Digits(3, 4), "Invalid CVC"),
        rule("name", Check::Required, "Cardholder name is required"),
    ];
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Platform fee and total charged for `amount` at `percent`.
pub fn fee_and_total(amount: f64, percent: f64) -> (f64, f64) {
    let fee = round2(amount * percent / 100.0);
    (fee, round2(amount + fee))
}

fn card_brand(number: &str) -> &'static str {
    match number.chars().next() {
        Some('4') => "visa",
        Some('5') => "mastercard",
        Some('3') => "amex",
        Some('6') => "discover",
        _ => "card",
    }
}

/// `MM/YY` cards stay valid through the end of their month.
fn is_expired(expiry: &str) -> bool {
    let Some((mm, yy)) = expiry.split_once('/') else {
        return true;
    };
    let (Ok(month), Ok(year)) = (mm.parse::<u32>(), yy.parse::<i32>()) else {
        return true;
    };
    let today = chrono::Utc::now();
    (2000 + year, month) < (today.year(), today.month())
}

fn row_to_payment(row: &SqliteRow) -> Payment {
    let status: String = row.get("status");
    Payment {
        id: row.get("id"),
        project_id: row.get("project_id"),
        bid_id: row.get("bid_id"),
        payer_id: row.get("payer_id"),
        payee_id: row.get("payee_id"),
        amount: row.get("amount"),
        fee: row.get("fee"),
        total: row.get("total"),
        status: PaymentStatus::parse(&status).unwrap_or(PaymentStatus::Failed),
        card_brand: row.get("card_brand"),
        card_last4: row.get("card_last4"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

async fn find_payment(db: &Database, payment_id: &str) -> AppResult<Option<Payment>> {
    let row = sqlx::query("SELECT * FROM payments WHERE id = ?")
        .bind(payment_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.as_ref().map(row_to_payment))
}

async fn live_payment(db: &Database, project_id: &str) -> AppResult<Option<Payment>> {
    let row = sqlx::query("SELECT * FROM payments WHERE project_id = ? AND status != 'failed'")
        .bind(project_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.as_ref().map(row_to_payment))
}

pub async fn create_intent(state: &AppState, caller: &AuthUser, req: CreateIntentRequest) -> AppResult<Payment> {
    let project_id = require_id(&req.project_id, "project")?;
    let bid_id = require_id(&req.bid_id, "bid")?;
    let project = projects::get_project(&state.db, &project_id).await?;
    if project.client_id != caller.user_id {
        return Err(AppError::forbidden("Not authorized"));
    }
    let bid = project.bid(&bid_id).ok_or_else(|| AppError::not_found("Bid not found"))?;
    if project.accepted_bid().map(|b| b.id.as_str()) != Some(bid.id.as_str()) {
        return Err(AppError::bad_request("Only the accepted bid can be paid"));
    }
    if (round2(req.amount) - round2(bid.amount)).abs() > f64::EPSILON {
        return Err(AppError::bad_request("Amount does not match the accepted bid"));
    }

    if let Some(existing) = live_payment(&state.db, &project_id).await? {
        if existing.status == PaymentStatus::Pending && existing.bid_id == bid_id {
            return Ok(existing);
        }
        return Err(AppError::conflict("Project already has a payment"));
    }

    let (fee, total) = fee_and_total(bid.amount, state.config.platform_fee_percent);
    let payment_id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();
    let inserted = sqlx::query(
        "INSERT INTO payments (id, project_id, bid_id, payer_id, payee_id, amount, fee, total, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)",
    )
    .bind(&payment_id)
    .bind(&project_id)
    .bind(&bid_id)
    .bind(&caller.user_id)
    .bind(&bid.freelancer_id)
    .bind(bid.amount)
    .bind(fee)
    .bind(total)
    .bind(now)
    .bind(now)
    .execute(&state.db.pool)
    .await;
    if let Err(e) = inserted {
        if is_unique_violation(&e) {
            return Err(AppError::conflict("Project already has a payment"));
        }
        return Err(e.into());
    }

    log::info!("[PAYMENTS] Intent {} for project {}: {:.2} + {:.2} fee", payment_id, project_id, bid.amount, fee);
    find_payment(&state.db, &payment_id)
        .await?
        .ok_or_else(|| AppError::not_found("Payment not found"))
}

pub async fn process_payment(state: &AppState, caller: &AuthUser, req: ProcessPaymentRequest) -> AppResult<Payment> {
    let payment_id = require_id(&req.payment_intent_id, "payment")?;
    let payment = find_payment(&state.db, &payment_id)
        .await?
        .ok_or_else(|| AppError::not_found("Payment not found"))?;
    if payment.payer_id != caller.user_id {
        return Err(AppError::forbidden("Not authorized"));
    }
    if payment.status != PaymentStatus::Pending {
        return Err(AppError::bad_request("Payment is not pending"));
    }

    let digits: String = req.card_number.chars().filter(|c| c.is_ascii_digit()).collect();
    let brand = card_brand(&digits);
    let last4 = &digits[digits.len().saturating_sub(4)..];
    let now = now_millis();

    if is_expired(&req.expiry_date) {
        sqlx::query("UPDATE payments SET status = 'failed', card_brand = ?, card_last4 = ?, updated_at = ? WHERE id = ? AND status = 'pending'")
            .bind(brand)
            .bind(last4)
            .bind(now)
            .bind(&payment_id)
            .execute(&state.db.pool)
            .await?;
        log::info!("[PAYMENTS] Payment {} declined: card expired", payment_id);
        return Err(AppError::bad_request("Card has expired"));
    }

    let res = sqlx::query("UPDATE payments SET status = 'held', card_brand = ?, card_last4 = ?, updated_at = ? WHERE id = ? AND status = 'pending'")
        .bind(brand)
        .bind(last4)
        .bind(now)
        .bind(&payment_id)
        .execute(&state.db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(AppError::conflict("Payment was already processed"));
    }

    log::info!("[PAYMENTS] Payment {} held in escrow ({} ending {})", payment_id, brand, last4);
    notifications::notify(
        state,
        &payment.payee_id,
        NotificationKind::PaymentHeld,
        &format!("Payment of {:.2} is held in escrow for your work", payment.amount),
    )
    .await;

    find_payment(&state.db, &payment_id)
        .await?
        .ok_or_else(|| AppError::not_found("Payment not found"))
}

/// Payments where the user is payer or payee, newest first.
pub async fn history(db: &Database, user_id: &str) -> AppResult<Vec<Payment>> {
    let rows = sqlx::query("SELECT * FROM payments WHERE payer_id = ? OR payee_id = ? ORDER BY created_at DESC, rowid DESC")
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows.iter().map(row_to_payment).collect())
}

pub async fn details(db: &Database, caller: &AuthUser, payment_id: &str) -> AppResult<Payment> {
    let payment = find_payment(db, payment_id)
        .await?
        .ok_or_else(|| AppError::not_found("Payment not found"))?;
    if payment.payer_id != caller.user_id && payment.payee_id != caller.user_id {
        return Err(AppError::forbidden("Not authorized"));
    }
    Ok(payment)
}

pub async fn release(state: &AppState, caller: &AuthUser, project_id: &str, bid_id: &str) -> AppResult<Payment> {
    let project = projects::get_project(&state.db, project_id).await?;
    if project.client_id != caller.user_id {
        return Err(AppError::forbidden("Not authorized"));
    }
    if project.bid(bid_id).is_none() {
        return Err(AppError::not_found("Bid not found"));
    }
    let payment = live_payment(&state.db, project_id)
        .await?
        .filter(|p| p.bid_id == bid_id)
        .ok_or_else(|| AppError::not_found("Payment not found"))?;
    if payment.status != PaymentStatus::Held {
        return Err(AppError::bad_request("Payment is not held in escrow"));
    }

    let now = now_millis();
    let mut tx = state.db.pool.begin().await?;
    let res = sqlx::query("UPDATE payments SET status = 'released', updated_at = ? WHERE id = ? AND status = 'held'")
        .bind(now)
        .bind(&payment.id)
        .execute(&mut *tx)
        .await?;
    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(AppError::conflict("Payment was already released"));
    }
    sqlx::query("UPDATE projects SET status = ?, version = version + 1, updated_at = ? WHERE id = ?")
        .bind(ProjectStatus::Completed.as_str())
        .bind(now)
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    log::info!("[PAYMENTS] Payment {} released, project {} completed", payment.id, project_id);
    notifications::notify(
        state,
        &payment.payee_id,
        NotificationKind::PaymentReleased,
        &format!("Payment of {:.2} for \"{}\" has been released", payment.amount, project.title),
    )
    .await;

    find_payment(&state.db, &payment.id)
        .await?
        .ok_or_else(|| AppError::not_found("Payment not found"))
}
