use crate::domain::balance::CoinBalance;
use crate::domain::settlement::{BonusEntry, CommissionEntry, RankEntry};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct BalanceRow<'a> {
    user_id: &'a str,
    balance: u64,
}

/// Writes balances and settlement tables as CSV, one header row per table.
pub struct TableWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> TableWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// `user_id,balance`
    pub fn write_balances(self, balances: &[CoinBalance]) -> Result<()> {
        self.write_rows(balances.iter().map(|b| BalanceRow {
            user_id: &b.user_id,
            balance: b.amount.value(),
        }))
    }

    /// `subject_id,rating_sum,review_count,rank_position,updated_at`
    pub fn write_rankings(self, entries: &[RankEntry]) -> Result<()> {
        self.write_rows(entries)
    }

    /// `subject_id,amount,month,created_at`
    pub fn write_commissions(self, entries: &[CommissionEntry]) -> Result<()> {
        self.write_rows(entries)
    }

    /// `subject_id,amount,period,created_at`
    pub fn write_bonuses(self, entries: &[BonusEntry]) -> Result<()> {
        self.write_rows(entries)
    }

    fn write_rows<I>(mut self, rows: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Serialize,
    {
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::balance::Coins;
    use chrono::{TimeZone, Utc};

    fn render(write: impl FnOnce(TableWriter<&mut Vec<u8>>) -> Result<()>) -> String {
        let mut out = Vec::new();
        write(TableWriter::new(&mut out)).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_write_balances() {
        let at = Utc::now();
        let balances = vec![
            CoinBalance {
                user_id: "alice".to_string(),
                amount: Coins(60),
                updated_at: at,
            },
            CoinBalance {
                user_id: "bob".to_string(),
                amount: Coins(40),
                updated_at: at,
            },
        ];
        let out = render(|w| w.write_balances(&balances));
        assert_eq!(out, "user_id,balance\nalice,60\nbob,40\n");
    }

    #[test]
    fn test_write_rankings() {
        let at = Utc.with_ymd_and_hms(2025, 6, 30, 0, 0, 0).unwrap();
        let entries = vec![RankEntry {
            subject_id: "s1".to_string(),
            rating_sum: 14,
            review_count: 3,
            rank_position: 1,
            updated_at: at,
        }];
        let out = render(|w| w.write_rankings(&entries));
        let mut lines = out.lines();
        assert_eq!(
            lines.next(),
            Some("subject_id,rating_sum,review_count,rank_position,updated_at")
        );
        assert!(lines.next().unwrap().starts_with("s1,14,3,1,2025-06-30T00:00:00"));
    }

    #[test]
    fn test_write_commissions_uses_month_key() {
        let at = Utc::now();
        let entries = vec![CommissionEntry {
            subject_id: "s1".to_string(),
            amount: 150.0,
            month: "2025-06".parse().unwrap(),
            created_at: at,
        }];
        let out = render(|w| w.write_commissions(&entries));
        assert!(out.starts_with("subject_id,amount,month,created_at\ns1,150.0,2025-06,"));
    }

    #[test]
    fn test_empty_table_writes_nothing() {
        let out = render(|w| w.write_bonuses(&[]));
        assert_eq!(out, "");
    }
}
