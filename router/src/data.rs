//! JSONL readers for corpus and query files laid out the BEIR way
use anyhow::{Context, Result};
use dense_search_core::{CorpusItem, QueryItem};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Deserialize)]
struct CorpusRecord {
    #[serde(rename = "_id")]
    id: String,
    #[serde(default)]
    title: Option<String>,
    text: String,
}

#[derive(Deserialize)]
struct QueryRecord {
    #[serde(rename = "_id")]
    id: String,
    text: String,
}

fn read_jsonl<R, T, F, O>(reader: R, convert: F) -> Result<Vec<O>>
where
    R: BufRead,
    T: for<'de> Deserialize<'de>,
    F: Fn(T) -> O,
{
    let mut items = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("could not read line {}", i + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: T = serde_json::from_str(&line)
            .with_context(|| format!("malformed record on line {}", i + 1))?;
        items.push(convert(record));
    }
    Ok(items)
}

pub fn read_corpus<R: BufRead>(reader: R) -> Result<Vec<CorpusItem>> {
    read_jsonl(reader, |record: CorpusRecord| CorpusItem {
        id: record.id,
        title: record.title,
        text: record.text,
    })
}

pub fn read_queries<R: BufRead>(reader: R) -> Result<Vec<QueryItem>> {
    read_jsonl(reader, |record: QueryRecord| QueryItem {
        id: record.id,
        text: record.text,
    })
}

pub fn load_corpus(path: &Path) -> Result<Vec<CorpusItem>> {
    let file = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    read_corpus(BufReader::new(file)).with_context(|| format!("in {}", path.display()))
}

pub fn load_queries(path: &Path) -> Result<Vec<QueryItem>> {
    let file = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    read_queries(BufReader::new(file)).with_context(|| format!("in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_corpus() {
        let input = r#"{"_id": "d1", "title": "Rust", "text": "systems language", "metadata": {}}

{"_id": "d2", "text": "no title"}
"#;
        let corpus = read_corpus(input.as_bytes()).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus[0].title.as_deref(), Some("Rust"));
        assert_eq!(corpus[1].id, "d2");
        assert_eq!(corpus[1].title, None);
    }

    #[test]
    fn test_read_queries_reports_line() {
        let input = "{\"_id\": \"q1\", \"text\": \"what\"}\n{\"_id\": 3}\n";
        let err = read_queries(input.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
