use serde::{Deserialize, Serialize};

/// # NDOC
/// component: `report::model`
/// purpose: Sink-neutral document tree the composer emits; rendering is the
///          publisher's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentModel {
    pub title: String,
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub paragraphs: Vec<String>,
    pub tables: Vec<TableModel>,
}

impl Section {
    pub fn new(heading: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
            ..Default::default()
        }
    }

    pub fn paragraph(mut self, text: impl Into<String>) -> Self {
        self.paragraphs.push(text.into());
        self
    }

    pub fn table(mut self, table: TableModel) -> Self {
        self.tables.push(table);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableModel {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableModel {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    /// Splits into consecutive tables of at most `cap` data rows, each
    /// repeating the header; the platform's per-create row limit drives this.
    pub fn chunked(&self, cap: usize) -> Vec<TableModel> {
        if self.rows.len() <= cap {
            return vec![self.clone()];
        }
        self.rows
            .chunks(cap)
            .map(|chunk| TableModel {
                headers: self.headers.clone(),
                rows: chunk.to_vec(),
            })
            .collect()
    }
}

// Currency prints with 0 decimals in summaries and 2 in tables; percentages
// with 1 decimal.

pub fn fmt_currency0(value: f64) -> String {
    format!("${}", group_thousands(&format!("{value:.0}")))
}

pub fn fmt_currency2(value: f64) -> String {
    let raw = format!("{value:.2}");
    let (int_part, frac_part) = raw.split_once('.').unwrap_or((raw.as_str(), "00"));
    format!("${}.{}", group_thousands(int_part), frac_part)
}

pub fn fmt_pct1(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

pub fn fmt_signed_pct1(fraction: f64) -> String {
    format!("{:+.1}%", fraction * 100.0)
}

fn group_thousands(digits: &str) -> String {
    let (sign, digits) = match digits.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", digits),
    };
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{sign}{grouped}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_rows(n: usize) -> TableModel {
        let mut table = TableModel::new(&["Name", "Spend"]);
        for i in 0..n {
            table.push_row(vec![format!("row-{i}"), format!("{i}")]);
        }
        table
    }

    #[test]
    fn chunking_twelve_rows_under_cap_five_gives_5_5_2() {
        let chunks = table_with_rows(12).chunked(5);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].rows.len(), 5);
        assert_eq!(chunks[1].rows.len(), 5);
        assert_eq!(chunks[2].rows.len(), 2);
        for chunk in &chunks {
            assert_eq!(chunk.headers, vec!["Name", "Spend"]);
        }
    }

    #[test]
    fn chunking_under_cap_returns_single_table() {
        let chunks = table_with_rows(4).chunked(5);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].rows.len(), 4);
    }

    #[test]
    fn currency_formats_group_thousands() {
        assert_eq!(fmt_currency0(23_000.4), "$23,000");
        assert_eq!(fmt_currency2(1_234_567.891), "$1,234,567.89");
        assert_eq!(fmt_currency0(999.0), "$999");
        assert_eq!(fmt_currency0(-1_500.0), "$-1,500");
    }

    #[test]
    fn percent_formats_to_one_decimal() {
        assert_eq!(fmt_pct1(0.456), "45.6%");
        assert_eq!(fmt_signed_pct1(-0.125), "-12.5%");
        assert_eq!(fmt_signed_pct1(0.25), "+25.0%");
    }
}
