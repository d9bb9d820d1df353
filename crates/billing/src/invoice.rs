//! Invoice numbering, lifecycle, and document rendering
//!
//! Invoice numbers follow `INV-<4-digit-year>-<5-digit-seq>` and are unique
//! and monotonically increasing within a calendar year. The sequence comes
//! from an atomic per-year counter row (`invoice_counters`), so concurrent
//! invoice creation cannot mint duplicates. The rendered HTML document is a
//! compatibility surface: it is emailed to customers as an attachment and
//! its structure must stay stable.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventLogger, BillingEventType};

/// Invoice lifecycle states, stored as lowercase text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Unpaid,
    Paid,
    Cancelled,
    Overdue,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Unpaid => "unpaid",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
            InvoiceStatus::Overdue => "overdue",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(InvoiceStatus::Unpaid),
            "paid" => Some(InvoiceStatus::Paid),
            "cancelled" => Some(InvoiceStatus::Cancelled),
            "overdue" => Some(InvoiceStatus::Overdue),
            _ => None,
        }
    }

    /// Transitions are one-directional; paid and cancelled are terminal.
    pub fn can_transition_to(&self, next: InvoiceStatus) -> bool {
        matches!(
            (self, next),
            (InvoiceStatus::Unpaid, InvoiceStatus::Paid)
                | (InvoiceStatus::Unpaid, InvoiceStatus::Cancelled)
                | (InvoiceStatus::Unpaid, InvoiceStatus::Overdue)
                | (InvoiceStatus::Overdue, InvoiceStatus::Paid)
                | (InvoiceStatus::Overdue, InvoiceStatus::Cancelled)
        )
    }
}

/// Billing document
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub number: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub tax: Decimal,
    pub status: String,
    pub due_date: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Stored line item
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InvoiceItem {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub total: Decimal,
}

/// Line item as supplied by the caller
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceItemInput {
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Issuer identity printed on every invoice document
#[derive(Debug, Clone)]
pub struct IssuerInfo {
    pub name: String,
    pub address: String,
    pub email: String,
}

impl IssuerInfo {
    pub fn from_env() -> Self {
        Self {
            name: std::env::var("INVOICE_ISSUER_NAME").unwrap_or_else(|_| "Hostara".to_string()),
            address: std::env::var("INVOICE_ISSUER_ADDRESS").unwrap_or_default(),
            email: std::env::var("INVOICE_ISSUER_EMAIL")
                .unwrap_or_else(|_| "billing@hostara.io".to_string()),
        }
    }
}

const INVOICE_COLUMNS: &str =
    "id, number, user_id, amount, tax, status, due_date, paid_at, created_at";

const DEFAULT_DUE_DAYS: i64 = 7;

/// Format an invoice number: `INV-2025-00007`
pub fn format_invoice_number(year: i32, seq: i32) -> String {
    format!("INV-{:04}-{:05}", year, seq)
}

/// Sum line-item totals (quantity x unit price) into the invoice amount
pub fn sum_line_items(items: &[InvoiceItemInput]) -> Decimal {
    items
        .iter()
        .map(|i| Decimal::from(i.quantity) * i.unit_price)
        .sum()
}

/// Invoice creation and lifecycle service
#[derive(Clone)]
pub struct InvoiceService {
    pool: PgPool,
    events: BillingEventLogger,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Next invoice number for the current year
    ///
    /// The counter row is upserted atomically, so two concurrent creations
    /// get distinct sequence values in order.
    pub async fn next_invoice_number(&self) -> BillingResult<String> {
        let mut tx = self.pool.begin().await?;
        let number = next_number_in(&mut tx).await?;
        tx.commit().await?;
        Ok(number)
    }

    /// Create an UNPAID invoice from line items
    ///
    /// Amount is the sum of line totals; the due date defaults to 7 days
    /// out.
    pub async fn create_invoice(
        &self,
        user_id: Uuid,
        items: &[InvoiceItemInput],
        tax: Decimal,
        due_date: Option<OffsetDateTime>,
    ) -> BillingResult<Invoice> {
        if items.is_empty() {
            return Err(BillingError::InvalidAmount(Decimal::ZERO));
        }

        let amount = sum_line_items(items);
        let due_date =
            due_date.unwrap_or_else(|| OffsetDateTime::now_utc() + time::Duration::days(DEFAULT_DUE_DAYS));

        let mut tx = self.pool.begin().await?;
        let number = next_number_in(&mut tx).await?;

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (number, user_id, amount, tax, status, due_date)
            VALUES ($1, $2, $3, $4, 'unpaid', $5)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(&number)
        .bind(user_id)
        .bind(amount)
        .bind(tax)
        .bind(due_date)
        .fetch_one(&mut *tx)
        .await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO invoice_items (invoice_id, name, quantity, unit_price, total)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(invoice.id)
            .bind(&item.name)
            .bind(item.quantity)
            .bind(item.unit_price)
            .bind(Decimal::from(item.quantity) * item.unit_price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            number = %number,
            amount = %amount,
            "Invoice created"
        );

        self.events
            .log(
                BillingEventType::InvoiceCreated,
                ActorType::System,
                Some(user_id),
                serde_json::json!({ "number": number, "amount": amount }),
            )
            .await;

        Ok(invoice)
    }

    pub async fn get_invoice(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        invoice.ok_or(BillingError::InvoiceNotFound(invoice_id))
    }

    pub async fn items_for_invoice(&self, invoice_id: Uuid) -> BillingResult<Vec<InvoiceItem>> {
        let items = sqlx::query_as::<_, InvoiceItem>(
            "SELECT id, invoice_id, name, quantity, unit_price, total \
             FROM invoice_items WHERE invoice_id = $1 ORDER BY id",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    pub async fn invoices_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Invoice>> {
        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE user_id = $1 ORDER BY created_at DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(invoices)
    }

    /// UNPAID or OVERDUE -> PAID. No ledger interaction; invoice payment and
    /// balance changes are decoupled.
    pub async fn mark_paid(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        let invoice = self
            .transition(invoice_id, InvoiceStatus::Paid, "paid_at = NOW(),")
            .await?;

        self.events
            .log(
                BillingEventType::InvoicePaid,
                ActorType::System,
                Some(invoice.user_id),
                serde_json::json!({ "number": invoice.number }),
            )
            .await;

        Ok(invoice)
    }

    /// UNPAID or OVERDUE -> CANCELLED (terminal)
    pub async fn cancel(&self, invoice_id: Uuid) -> BillingResult<Invoice> {
        self.transition(invoice_id, InvoiceStatus::Cancelled, "").await
    }

    async fn transition(
        &self,
        invoice_id: Uuid,
        to: InvoiceStatus,
        extra_set: &str,
    ) -> BillingResult<Invoice> {
        let updated: Option<Invoice> = sqlx::query_as(&format!(
            r#"
            UPDATE invoices
            SET {extra_set} status = $2
            WHERE id = $1 AND status IN ('unpaid', 'overdue')
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(invoice) => {
                tracing::info!(number = %invoice.number, status = to.as_str(), "Invoice transitioned");
                Ok(invoice)
            }
            None => {
                let current = self.get_invoice(invoice_id).await?;
                Err(BillingError::InvalidStatusTransition {
                    from: current.status,
                    to: to.as_str().to_string(),
                })
            }
        }
    }

    /// Flip every UNPAID invoice with an elapsed due date to OVERDUE
    ///
    /// Idempotent; safe to run on any schedule.
    pub async fn check_overdue_invoices(&self) -> BillingResult<u64> {
        let flipped: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            UPDATE invoices
            SET status = 'overdue'
            WHERE status = 'unpaid' AND due_date < NOW()
            RETURNING user_id, number
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if !flipped.is_empty() {
            tracing::info!(flipped = flipped.len(), "Invoices marked overdue");
        }

        for (user_id, number) in &flipped {
            self.events
                .log(
                    BillingEventType::InvoiceOverdue,
                    ActorType::System,
                    Some(*user_id),
                    serde_json::json!({ "number": number }),
                )
                .await;
        }

        Ok(flipped.len() as u64)
    }
}

async fn next_number_in(tx: &mut sqlx::Transaction<'_, Postgres>) -> BillingResult<String> {
    let year = OffsetDateTime::now_utc().year();

    let seq: i32 = sqlx::query_scalar(
        r#"
        INSERT INTO invoice_counters (year, last_seq)
        VALUES ($1, 1)
        ON CONFLICT (year) DO UPDATE SET last_seq = invoice_counters.last_seq + 1
        RETURNING last_seq
        "#,
    )
    .bind(year)
    .fetch_one(&mut **tx)
    .await?;

    Ok(format_invoice_number(year, seq))
}

/// Render the invoice as a self-contained HTML document
///
/// Fixed structure: header (issuer identity + number/date/status),
/// two-party block, itemized table, subtotal/tax/total block, and a
/// conditional payment-status callout. Emailed as an attachment.
pub fn render_html(
    invoice: &Invoice,
    items: &[InvoiceItem],
    issuer: &IssuerInfo,
    customer_email: &str,
) -> String {
    let date_format =
        time::macros::format_description!("[year]-[month]-[day]");
    let created = invoice
        .created_at
        .format(&date_format)
        .unwrap_or_default();
    let due = invoice.due_date.format(&date_format).unwrap_or_default();
    let total = invoice.amount + invoice.tax;

    let mut rows = String::new();
    for item in items {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>${}</td><td>${}</td></tr>\n",
            item.name, item.quantity, item.unit_price, item.total
        ));
    }

    let callout = match InvoiceStatus::from_str(&invoice.status) {
        Some(InvoiceStatus::Paid) => {
            let paid = invoice
                .paid_at
                .map(|p| p.format(&date_format).unwrap_or_default())
                .unwrap_or_default();
            format!(
                r#"<div class="callout paid">Paid on {paid}. Thank you.</div>"#
            )
        }
        Some(InvoiceStatus::Overdue) => format!(
            r#"<div class="callout overdue">This invoice was due on {due} and is now overdue.</div>"#
        ),
        Some(InvoiceStatus::Cancelled) => {
            r#"<div class="callout cancelled">This invoice has been cancelled.</div>"#.to_string()
        }
        _ => format!(r#"<div class="callout unpaid">Payment due by {due}.</div>"#),
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<style>
body {{ font-family: Arial, sans-serif; color: #222; margin: 40px; }}
.header {{ display: flex; justify-content: space-between; border-bottom: 2px solid #333; padding-bottom: 16px; }}
.parties {{ display: flex; justify-content: space-between; margin: 24px 0; }}
table {{ width: 100%; border-collapse: collapse; }}
th, td {{ text-align: left; padding: 8px; border-bottom: 1px solid #ddd; }}
.totals {{ margin-top: 16px; text-align: right; }}
.callout {{ margin-top: 24px; padding: 12px; border-radius: 4px; }}
.callout.paid {{ background: #e6f4ea; }}
.callout.overdue {{ background: #fce8e6; }}
.callout.unpaid {{ background: #fef7e0; }}
.callout.cancelled {{ background: #eee; }}
</style>
</head>
<body>
<div class="header">
  <div>
    <h1>{issuer_name}</h1>
    <p>{issuer_address}<br>{issuer_email}</p>
  </div>
  <div>
    <h2>Invoice {number}</h2>
    <p>Date: {created}<br>Status: {status}</p>
  </div>
</div>
<div class="parties">
  <div><strong>From</strong><br>{issuer_name}</div>
  <div><strong>To</strong><br>{customer_email}</div>
</div>
<table>
  <thead><tr><th>Item</th><th>Qty</th><th>Unit price</th><th>Total</th></tr></thead>
  <tbody>
{rows}  </tbody>
</table>
<div class="totals">
  <p>Subtotal: ${subtotal}<br>Tax: ${tax}<br><strong>Total: ${total}</strong></p>
</div>
{callout}
</body>
</html>
"#,
        issuer_name = issuer.name,
        issuer_address = issuer.address,
        issuer_email = issuer.email,
        number = invoice.number,
        created = created,
        status = invoice.status,
        customer_email = customer_email,
        rows = rows,
        subtotal = invoice.amount,
        tax = invoice.tax,
        total = total,
        callout = callout,
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use rust_decimal_macros::dec;

    fn item(name: &str, quantity: i32, unit_price: Decimal) -> InvoiceItemInput {
        InvoiceItemInput {
            name: name.to_string(),
            quantity,
            unit_price,
        }
    }

    #[test]
    fn test_invoice_number_format() {
        assert_eq!(format_invoice_number(2025, 7), "INV-2025-00007");
        assert_eq!(format_invoice_number(2025, 12345), "INV-2025-12345");
        assert_eq!(format_invoice_number(2026, 1), "INV-2026-00001");
    }

    #[test]
    fn test_invoice_numbers_sort_within_year() {
        let numbers: Vec<String> = (1..=120).map(|s| format_invoice_number(2025, s)).collect();
        let mut sorted = numbers.clone();
        sorted.sort();
        assert_eq!(numbers, sorted, "zero padding must keep lexicographic order");
    }

    #[test]
    fn test_sum_line_items() {
        let items = vec![
            item("VPS-1 monthly", 2, dec!(9.99)),
            item("Backup slot", 1, dec!(3.50)),
        ];
        assert_eq!(sum_line_items(&items), dec!(23.48));
    }

    #[test]
    fn test_status_transitions() {
        use InvoiceStatus::*;
        assert!(Unpaid.can_transition_to(Paid));
        assert!(Unpaid.can_transition_to(Overdue));
        assert!(Unpaid.can_transition_to(Cancelled));
        assert!(Overdue.can_transition_to(Paid));
        assert!(!Paid.can_transition_to(Unpaid));
        assert!(!Cancelled.can_transition_to(Paid));
        assert!(!Overdue.can_transition_to(Unpaid));
    }

    fn sample_invoice(status: &str) -> Invoice {
        Invoice {
            id: Uuid::new_v4(),
            number: "INV-2025-00042".to_string(),
            user_id: Uuid::new_v4(),
            amount: dec!(23.48),
            tax: dec!(4.70),
            status: status.to_string(),
            due_date: OffsetDateTime::now_utc() + time::Duration::days(7),
            paid_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_render_html_contains_fixed_structure() {
        let invoice = sample_invoice("unpaid");
        let items = vec![InvoiceItem {
            id: Uuid::new_v4(),
            invoice_id: invoice.id,
            name: "VPS-1 monthly".to_string(),
            quantity: 2,
            unit_price: dec!(9.99),
            total: dec!(19.98),
        }];
        let issuer = IssuerInfo {
            name: "Hostara".to_string(),
            address: "1 Harbor Way".to_string(),
            email: "billing@hostara.io".to_string(),
        };

        let html = render_html(&invoice, &items, &issuer, "customer@example.com");

        assert!(html.contains("INV-2025-00042"));
        assert!(html.contains("VPS-1 monthly"));
        assert!(html.contains("customer@example.com"));
        assert!(html.contains("Subtotal: $23.48"));
        assert!(html.contains("Total: $28.18"));
        assert!(html.contains("Payment due by"));
    }

    #[test]
    fn test_render_html_callout_varies_by_status() {
        let issuer = IssuerInfo {
            name: "Hostara".to_string(),
            address: String::new(),
            email: "billing@hostara.io".to_string(),
        };

        let mut paid = sample_invoice("paid");
        paid.paid_at = Some(OffsetDateTime::now_utc());
        let html = render_html(&paid, &[], &issuer, "c@example.com");
        assert!(html.contains("Paid on"));

        let overdue = sample_invoice("overdue");
        let html = render_html(&overdue, &[], &issuer, "c@example.com");
        assert!(html.contains("now overdue"));
    }
}
