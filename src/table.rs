/// Rectangular, string-valued table: ordered headers plus rows.
///
/// Every row always has exactly `headers.len()` cells. Rows pushed with
/// fewer cells are padded with empty strings on the right; extra cells are
/// dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn width(&self) -> usize {
        self.headers.len()
    }

    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn extend_rows<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        for row in rows {
            self.push_row(row);
        }
    }

    pub fn into_rows(self) -> Vec<Vec<String>> {
        self.rows
    }
}
