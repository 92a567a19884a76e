use std::io::Cursor;
use rocket::http::ContentType;
use rocket::response::{self, Responder, Response};
use rocket::Request;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A CSV document sent as a download.
pub struct CsvFile {
    pub file_name: String,
    pub content: String,
}
impl<'r> Responder<'r, 'static> for CsvFile {
    fn respond_to(self, _request: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .header(ContentType::CSV)
            .raw_header("Content-Disposition", format!("attachment; filename=\"{}\"", self.file_name))
            .sized_body(self.content.len(), Cursor::new(self.content))
            .ok()
    }
}

pub fn to_csv<T: Serialize>(rows: &[T]) -> anyhow::Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(vec![]);
    for row in rows {
        writer.serialize(row)?;
    }
    let data = writer.into_inner().map_err(|e| anyhow::anyhow!("CSV flush error: {e}"))?;
    Ok(String::from_utf8(data)?)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CsvLineError {
    pub line: u64,
    pub error: String,
}

/// Parses every data row, keeping per-line errors so an import can report all of them at once.
pub fn parse_csv<T: DeserializeOwned>(text: &str) -> anyhow::Result<Vec<(u64, Result<T, String>)>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(false)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();
    let mut rows = vec![];
    for record in reader.records() {
        match record {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or_default();
                let result = record.deserialize::<T>(Some(&headers)).map_err(|e| e.to_string());
                rows.push((line, result));
            }
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or_default();
                rows.push((line, Err(e.to_string())));
            }
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Row {
        name: String,
        notes: Option<String>,
        credits: i64,
    }

    #[test]
    fn test_to_csv_quotes_when_needed() {
        let rows = vec![
            Row { name: "Vault, basics".to_string(), notes: None, credits: 10 },
            Row { name: "Say \"hi\"".to_string(), notes: Some("x".to_string()), credits: 1 },
        ];
        let csv = to_csv(&rows).unwrap();
        assert_eq!(csv, "name,notes,credits\n\"Vault, basics\",,10\n\"Say \"\"hi\"\"\",x,1\n");
    }

    #[test]
    fn test_parse_csv_reports_lines() {
        let text = "name,notes,credits\nKong,,5\nLache,swing,many\n\"Cat, leap\",\"a \"\"b\"\"\",2\n";
        let rows = parse_csv::<Row>(text).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0, 2);
        assert_eq!(rows[0].1, Ok(Row { name: "Kong".to_string(), notes: None, credits: 5 }));
        assert_eq!(rows[1].0, 3);
        assert!(rows[1].1.is_err());
        assert_eq!(rows[2].1, Ok(Row { name: "Cat, leap".to_string(), notes: Some("a \"b\"".to_string()), credits: 2 }));
    }
}
