//! Report Renderer Port
//! Mission: Byte-stable export rendering behind a trait
//!
//! Purity is part of the contract: byte-equal inputs must produce byte-equal
//! output, so frozen statements export identically forever. The built-in
//! renderer emits self-contained artifacts; deployments with branded PDF or
//! real XLSX templates implement the trait themselves.

use crate::statements::models::{Statement, StatementItem};
use anyhow::Result;
use std::fmt::Write as _;

pub trait ReportRenderer: Send + Sync {
    fn pdf(&self, statement: &Statement, items: &[StatementItem]) -> Result<Vec<u8>>;
    fn xlsx(&self, statement: &Statement, items: &[StatementItem]) -> Result<Vec<u8>>;
}

/// Deterministic renderer: a minimal one-page PDF and a tab-separated sheet.
pub struct PlainReportRenderer;

impl PlainReportRenderer {
    fn table(statement: &Statement, items: &[StatementItem]) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "statement\t{}\t{}\t{}\t{}\tv{}",
            statement.id, statement.station_id, statement.month, statement.category, statement.version
        );
        let _ = writeln!(out, "day\tenergy_kwh\tamount\tcurrency");
        for item in items {
            let _ = writeln!(
                out,
                "{}\t{:.3}\t{:.2}\t{}",
                item.day_start.format("%Y-%m-%d"),
                item.energy_kwh,
                item.amount,
                item.currency
            );
        }
        let _ = writeln!(
            out,
            "total\t{:.3}\t{:.2}\t{}",
            statement.total_energy_kwh, statement.total_amount, statement.currency
        );
        out
    }
}

impl ReportRenderer for PlainReportRenderer {
    fn pdf(&self, statement: &Statement, items: &[StatementItem]) -> Result<Vec<u8>> {
        // Single-page PDF with the table as a text stream. Every byte is a
        // function of the inputs.
        let text = Self::table(statement, items);
        let escaped = text
            .replace('\\', "\\\\")
            .replace('(', "\\(")
            .replace(')', "\\)");
        let mut content = String::new();
        let _ = writeln!(content, "BT /F1 9 Tf 36 756 Td 11 TL");
        for line in escaped.lines() {
            let _ = writeln!(content, "({}) '", line);
        }
        let _ = writeln!(content, "ET");

        let objects = [
            "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_string(),
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R \
             /Resources << /Font << /F1 5 0 R >> >> >>"
                .to_string(),
            format!("<< /Length {} >>\nstream\n{}endstream", content.len(), content),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Courier >>".to_string(),
        ];

        let mut pdf = String::from("%PDF-1.4\n");
        let mut offsets = Vec::with_capacity(objects.len());
        for (i, body) in objects.iter().enumerate() {
            offsets.push(pdf.len());
            let _ = writeln!(pdf, "{} 0 obj\n{}\nendobj", i + 1, body);
        }
        let xref_at = pdf.len();
        let _ = writeln!(pdf, "xref\n0 {}", objects.len() + 1);
        let _ = writeln!(pdf, "0000000000 65535 f ");
        for offset in &offsets {
            let _ = writeln!(pdf, "{:010} 00000 n ", offset);
        }
        let _ = write!(
            pdf,
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_at
        );
        Ok(pdf.into_bytes())
    }

    fn xlsx(&self, statement: &Statement, items: &[StatementItem]) -> Result<Vec<u8>> {
        Ok(Self::table(statement, items).into_bytes())
    }
}
