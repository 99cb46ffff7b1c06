use std::io::Write;

use chrono::{DateTime, Utc};
use csv::Writer;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::{UserId, WithdrawalId};
use crate::withdrawal::PendingPage;

#[derive(Debug, Serialize)]
pub struct PendingRow<'a> {
    pub id: WithdrawalId,
    pub user: UserId,
    pub card_number: Option<&'a str>,
    pub amount: Decimal,
    pub payout: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Writes one page of pending withdrawals as CSV, header included.
pub fn print_pending<W>(output: &mut W, page: &PendingPage) -> anyhow::Result<()>
where
    W: Write,
{
    let mut writer = Writer::from_writer(output);
    if page.items.is_empty() {
        // serialize writes the header with the first row only
        writer.write_record(["id", "user", "card_number", "amount", "payout", "created_at"])?;
    }
    for item in &page.items {
        let row = PendingRow {
            id: item.withdrawal.id,
            user: item.withdrawal.user_id,
            card_number: item.withdrawal.card_number.as_deref(),
            amount: item.withdrawal.amount,
            payout: item.payout,
            created_at: item.withdrawal.created_at,
        };
        if let Err(err) = writer.serialize(row) {
            anyhow::bail!("Failed to write to CSV: {err}")
        }
    }
    // Ensure all data is flushed to the output
    if let Err(err) = writer.flush() {
        anyhow::bail!("Failed to flush CSV writer: {err}")
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use crate::models::{Withdrawal, WithdrawalStatus};
    use crate::withdrawal::PendingItem;

    use super::*;

    #[test]
    fn prints_page_rows() {
        let page = PendingPage {
            page: 0,
            pages: 1,
            total: 1,
            items: vec![PendingItem {
                withdrawal: Withdrawal {
                    id: 3,
                    user_id: 7,
                    amount: Decimal::from(100),
                    card_number: Some("4000123412341234".to_string()),
                    status: WithdrawalStatus::Pending,
                    created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                    settled_at: None,
                },
                payout: Decimal::new(9400, 2),
            }],
        };
        let mut out = Vec::new();
        print_pending(&mut out, &page).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "id,user,card_number,amount,payout,created_at\n\
             3,7,4000123412341234,100,94.00,2024-05-01T12:00:00Z\n"
        );
    }

    #[test]
    fn empty_page_is_just_the_header() {
        let page = PendingPage {
            page: 0,
            pages: 1,
            total: 0,
            items: Vec::new(),
        };
        let mut out = Vec::new();
        print_pending(&mut out, &page).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "id,user,card_number,amount,payout,created_at\n"
        );
    }
}
