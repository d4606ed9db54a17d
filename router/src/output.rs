use anyhow::Result;
use clap::ValueEnum;
use dense_search_core::merge::ranked;
use dense_search_core::SearchResults;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `{query_id: {corpus_id: score}}`
    Json,
    /// `qid Q0 docid rank score run_name`, one line per hit
    Trec,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Trec => write!(f, "trec"),
        }
    }
}

/// Write `results` with queries in `query_ids` order
pub fn write_results<W: Write>(
    mut writer: W,
    results: &SearchResults,
    query_ids: &[String],
    format: OutputFormat,
    run_name: &str,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let sorted: BTreeMap<&str, BTreeMap<&str, f32>> = results
                .iter()
                .map(|(qid, hits)| {
                    (
                        qid.as_str(),
                        hits.iter().map(|(id, s)| (id.as_str(), *s)).collect(),
                    )
                })
                .collect();
            serde_json::to_writer(&mut writer, &sorted)?;
            writeln!(writer)?;
        }
        OutputFormat::Trec => {
            for qid in query_ids {
                let Some(hits) = results.get(qid) else {
                    continue;
                };
                for (rank, (doc_id, score)) in ranked(hits).into_iter().enumerate() {
                    writeln!(writer, "{qid} Q0 {doc_id} {} {score} {run_name}", rank + 1)?;
                }
            }
        }
    }
    writer.flush()?;
    Ok(())
}
