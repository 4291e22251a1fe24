//! Paginated plain-text report of usage and transactions for one window
//!
//! Pages hold at most `rows_per_page` body lines. Tables repeat their column
//! header on every page they continue onto; a row never gets split or cut.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::BillingError;
use crate::models::{TransactionRecord, TxStatus, UsagePoint};
use crate::window::{filter_by_window, window_start, UnparsablePolicy, WindowKind};

/// Smallest page that fits the title block plus a table header and one row.
pub const MIN_ROWS_PER_PAGE: usize = 12;

const PAGE_BREAK: char = '\u{0c}';

#[derive(Debug, Clone)]
pub struct ReportDocument {
    pub filename: String,
    pub window: WindowKind,
    pub pages: Vec<String>,
    /// SHA-256 of the body lines, hex encoded. Printed on the last page.
    pub fingerprint: String,
    pub off_chain_rows: usize,
    /// `None` when the report carries no on-chain section.
    pub on_chain_rows: Option<usize>,
    pub transaction_rows: usize,
}

/// Usage rows to report, one slice per ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSources<'a> {
    pub off_chain: &'a [UsagePoint],
    /// `None` without a wallet session; the section is left out.
    pub on_chain: Option<&'a [UsagePoint]>,
}

impl ReportDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let separator = format!("{}", PAGE_BREAK);
        self.pages.join(&separator).into_bytes()
    }
}

struct Table {
    title: String,
    columns: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn widths(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                self.rows
                    .iter()
                    .map(|row| row[i].chars().count())
                    .chain(std::iter::once(column.len()))
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }

    fn render_row(cells: &[String], widths: &[usize]) -> String {
        cells
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    }

    fn header(&self, widths: &[usize]) -> (String, String) {
        let cells: Vec<String> = self.columns.iter().map(|c| c.to_string()).collect();
        let header = Self::render_row(&cells, widths);
        let rule = "-".repeat(header.chars().count());
        (header, rule)
    }
}

struct Pager {
    capacity: usize,
    pages: Vec<Vec<String>>,
    current: Vec<String>,
}

impl Pager {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pages: Vec::new(),
            current: Vec::new(),
        }
    }

    fn remaining(&self) -> usize {
        self.capacity - self.current.len()
    }

    fn push(&mut self, line: String) {
        if self.remaining() == 0 {
            self.advance();
        }
        self.current.push(line);
    }

    fn advance(&mut self) {
        let page = std::mem::take(&mut self.current);
        self.pages.push(page);
    }

    fn blank(&mut self) {
        if self.remaining() > 0 && !self.current.is_empty() {
            self.current.push(String::new());
        }
    }

    fn table(&mut self, table: &Table) {
        let widths = table.widths();
        let (header, rule) = table.header(&widths);

        // title, header, rule and at least one row stay together
        if self.remaining() < 4 {
            self.advance();
        }
        self.current.push(table.title.clone());
        self.current.push(header.clone());
        self.current.push(rule.clone());

        if table.rows.is_empty() {
            self.current.push("(no records in this window)".to_string());
            return;
        }

        for row in &table.rows {
            if self.remaining() == 0 {
                self.advance();
                self.current.push(format!("{} (continued)", table.title));
                self.current.push(header.clone());
                self.current.push(rule.clone());
            }
            self.current.push(Table::render_row(row, &widths));
        }
    }

    fn finish(mut self) -> Vec<Vec<String>> {
        if !self.current.is_empty() || self.pages.is_empty() {
            self.advance();
        }
        self.pages
    }
}

fn usage_table(title: &str, usage: &[UsagePoint]) -> Table {
    Table {
        title: title.to_string(),
        columns: vec!["Timestamp", "Usage (MB)", "Cumulative (MB)"],
        rows: usage
            .iter()
            .map(|u| {
                vec![
                    u.timestamp.clone(),
                    u.amount_mb.to_string(),
                    u.cumulative_mb.to_string(),
                ]
            })
            .collect(),
    }
}

pub struct ReportExporter {
    rows_per_page: usize,
    policy: UnparsablePolicy,
}

impl ReportExporter {
    pub fn new(rows_per_page: usize, policy: UnparsablePolicy) -> Result<Self, BillingError> {
        if rows_per_page < MIN_ROWS_PER_PAGE {
            return Err(BillingError::validation(format!(
                "rows_per_page must be at least {}",
                MIN_ROWS_PER_PAGE
            )));
        }
        Ok(Self { rows_per_page, policy })
    }

    /// Renders the records that fall in `window` as of `now`. Pure: no I/O.
    pub fn export(
        &self,
        usage: UsageSources<'_>,
        transactions: &[TransactionRecord],
        window: WindowKind,
        now: DateTime<Utc>,
    ) -> ReportDocument {
        let off_chain = filter_by_window(usage.off_chain, window, now, self.policy);
        let on_chain = usage
            .on_chain
            .map(|entries| filter_by_window(entries, window, now, self.policy));
        let transactions = filter_by_window(transactions, window, now, self.policy);

        let off_chain_total: u64 = off_chain.iter().map(|u| u.amount_mb).sum();
        let confirmed_fiat: f64 = transactions
            .iter()
            .filter(|t| t.status == TxStatus::Confirmed)
            .map(|t| t.amount_fiat)
            .sum();

        let mut pager = Pager::new(self.rows_per_page);
        pager.push("WiFi Billing Report".to_string());
        pager.push(format!(
            "Window: {} ({} to {})",
            window,
            window_start(window, now).format("%Y-%m-%d %H:%M:%S"),
            now.format("%Y-%m-%d %H:%M:%S")
        ));
        pager.push(format!("Generated: {} UTC", now.format("%Y-%m-%d %H:%M:%S")));
        pager.push(format!("Off-chain usage in window: {} MB", off_chain_total));
        if let Some(on_chain) = &on_chain {
            let on_chain_total: u64 = on_chain.iter().map(|u| u.amount_mb).sum();
            pager.push(format!("On-chain usage in window: {} MB", on_chain_total));
        }
        pager.push(format!("Confirmed payments: {:.2} KES", confirmed_fiat));
        pager.blank();

        pager.table(&usage_table("Off-chain usage", &off_chain));
        pager.blank();
        if let Some(on_chain) = &on_chain {
            pager.table(&usage_table("On-chain usage", on_chain));
            pager.blank();
        }

        pager.table(&Table {
            title: "Transactions".to_string(),
            columns: vec!["ID", "Account", "Amount (ETH)", "Amount (KES)", "Status", "Timestamp"],
            rows: transactions
                .iter()
                .map(|t| {
                    vec![
                        t.id.clone(),
                        t.username.clone().unwrap_or_else(|| t.account.clone()),
                        format!("{:.6}", t.amount_native),
                        format!("{:.2}", t.amount_fiat),
                        format!("{:?}", t.status),
                        t.timestamp.clone(),
                    ]
                })
                .collect(),
        });

        let body: String = pager
            .pages
            .iter()
            .flatten()
            .chain(pager.current.iter())
            .map(|line| format!("{}\n", line))
            .collect();
        let fingerprint = hex::encode(Sha256::digest(body.as_bytes()));

        if pager.remaining() < 2 {
            pager.advance();
        }
        pager.blank();
        pager.push(format!("SHA-256: {}", fingerprint));

        let pages = pager.finish();
        let total = pages.len();
        let pages = pages
            .into_iter()
            .enumerate()
            .map(|(i, lines)| {
                let mut text = lines.join("\n");
                text.push_str(&format!("\n\nPage {} of {}\n", i + 1, total));
                text
            })
            .collect();

        tracing::info!(
            "Rendered {} report: {} off-chain and {} on-chain usage rows, \
             {} transactions, {} pages",
            window,
            off_chain.len(),
            on_chain.as_ref().map_or(0, Vec::len),
            transactions.len(),
            total
        );

        ReportDocument {
            filename: format!("wifi-billing-{}-{}.txt", window, now.format("%Y%m%d-%H%M%S")),
            window,
            pages,
            fingerprint,
            off_chain_rows: off_chain.len(),
            on_chain_rows: on_chain.as_ref().map(Vec::len),
            transaction_rows: transactions.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordSource;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap()
    }

    fn usage(count: usize) -> Vec<UsagePoint> {
        (0..count)
            .map(|i| {
                let at = Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()
                    + chrono::Duration::seconds(i as i64);
                UsagePoint {
                    amount_mb: 1,
                    cumulative_mb: i as u64 + 1,
                    timestamp: at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    recorded_at: Some(at),
                }
            })
            .collect()
    }

    fn off_chain(records: &[UsagePoint]) -> UsageSources<'_> {
        UsageSources { off_chain: records, on_chain: None }
    }

    fn transaction(id: &str, at: DateTime<Utc>) -> TransactionRecord {
        TransactionRecord {
            id: id.to_string(),
            account: "0x609E600Ff6d549685b8E5B71d20616390A5B5e0D".into(),
            username: None,
            plan_id: None,
            amount_native: 0.002,
            amount_fiat: 500.0,
            timestamp: at.format("%Y-%m-%d %H:%M:%S").to_string(),
            recorded_at: Some(at),
            status: TxStatus::Confirmed,
            source: RecordSource::OnChain,
        }
    }

    #[test]
    fn rejects_tiny_pages() {
        assert!(ReportExporter::new(MIN_ROWS_PER_PAGE - 1, UnparsablePolicy::TreatAsNow).is_err());
    }

    #[test]
    fn every_row_survives_pagination() {
        let exporter =
            ReportExporter::new(MIN_ROWS_PER_PAGE, UnparsablePolicy::TreatAsNow).unwrap();
        let records = usage(50);
        let doc = exporter.export(off_chain(&records), &[], WindowKind::Daily, now());

        assert!(doc.page_count() > 1);
        assert_eq!(doc.off_chain_rows, 50);
        assert_eq!(doc.on_chain_rows, None);
        let text = String::from_utf8(doc.to_bytes()).unwrap();
        for record in &records {
            assert!(text.contains(&record.timestamp), "missing {}", record.timestamp);
        }

        for (i, page) in doc.pages.iter().enumerate() {
            assert!(page.trim_end().ends_with(&format!("Page {} of {}", i + 1, doc.page_count())));
            // body lines plus the blank line and footer
            assert!(page.lines().count() <= MIN_ROWS_PER_PAGE + 2);
        }
        assert!(doc.pages[1].contains("Off-chain usage (continued)"));
        assert!(doc.pages.last().unwrap().contains(&doc.fingerprint));
    }

    #[test]
    fn only_window_records_are_listed() {
        let exporter = ReportExporter::new(40, UnparsablePolicy::TreatAsNow).unwrap();
        let inside = transaction("chain-1", Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 1).unwrap());
        let outside =
            transaction("chain-2", Utc.with_ymd_and_hms(2024, 6, 14, 23, 59, 59).unwrap());

        let doc = exporter.export(
            UsageSources::default(),
            &[inside, outside],
            WindowKind::Daily,
            now(),
        );
        let text = String::from_utf8(doc.to_bytes()).unwrap();

        assert_eq!(doc.transaction_rows, 1);
        assert!(text.contains("chain-1"));
        assert!(!text.contains("chain-2"));
        assert!(text.contains("(no records in this window)"));
        assert_eq!(doc.filename, "wifi-billing-daily-20240615-100000.txt");
    }

    #[test]
    fn fingerprint_is_stable() {
        let exporter = ReportExporter::new(20, UnparsablePolicy::Exclude).unwrap();
        let records = usage(5);
        let first = exporter.export(off_chain(&records), &[], WindowKind::Weekly, now());
        let second = exporter.export(off_chain(&records), &[], WindowKind::Weekly, now());
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(first.fingerprint.len(), 64);
    }

    #[test]
    fn both_ledgers_get_their_own_section() {
        let exporter = ReportExporter::new(40, UnparsablePolicy::TreatAsNow).unwrap();
        let mut backend = usage(1);
        backend[0].amount_mb = 4242;
        let mut chain = usage(1);
        chain[0].amount_mb = 7;

        let doc = exporter.export(
            UsageSources { off_chain: &backend, on_chain: Some(&chain) },
            &[],
            WindowKind::Daily,
            now(),
        );
        let text = String::from_utf8(doc.to_bytes()).unwrap();

        assert!(text.contains("Off-chain usage in window: 4242 MB"));
        assert!(text.contains("On-chain usage in window: 7 MB"));
        assert!(text.find("Off-chain usage\n").unwrap() < text.find("On-chain usage\n").unwrap());
        assert_eq!(doc.on_chain_rows, Some(1));
    }

    #[test]
    fn on_chain_section_left_out_without_wallet() {
        let exporter = ReportExporter::new(40, UnparsablePolicy::TreatAsNow).unwrap();
        let records = usage(2);
        let doc = exporter.export(off_chain(&records), &[], WindowKind::Daily, now());
        let text = String::from_utf8(doc.to_bytes()).unwrap();

        assert!(text.contains("Off-chain usage"));
        assert!(!text.contains("On-chain usage"));
    }
}
