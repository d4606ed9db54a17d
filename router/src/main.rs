use anyhow::Result;
use clap::Parser;
use dense_search_backend_core::Device;
use dense_search_router::OutputFormat;
use std::path::PathBuf;

/// App Configuration
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Corpus JSONL file, one `{"_id", "title", "text"}` object per line
    #[clap(long, env)]
    corpus: PathBuf,

    /// Queries JSONL file, one `{"_id", "text"}` object per line
    #[clap(long, env)]
    queries: PathBuf,

    /// Base URL of a text-embeddings-inference server. One worker is started per endpoint;
    /// repeat the flag (or comma separate) to spread the corpus over several replicas.
    #[clap(
        default_value = "http://localhost:3000",
        long = "endpoint",
        env = "ENDPOINTS",
        value_delimiter = ','
    )]
    endpoints: Vec<Device>,

    /// Number of corpus items kept per query
    #[clap(default_value = "1000", long, env)]
    top_k: usize,

    /// `cos_sim` or `dot`
    #[clap(default_value = "cos_sim", long, env)]
    score_function: String,

    /// Number of inputs per encoding call
    #[clap(default_value = "128", long, env)]
    batch_size: usize,

    /// Corpus items per chunk dispatched to a worker.
    /// Derived from the corpus size and the number of endpoints if not set.
    #[clap(long, env)]
    corpus_chunk_size: Option<usize>,

    /// Dispatch the corpus in input order instead of longest documents first
    #[clap(long, env)]
    no_sort_corpus: bool,

    /// Write whatever was collected when some corpus chunks failed, instead of exiting with an
    /// error
    #[clap(long, env)]
    allow_partial: bool,

    /// Must not exceed the `--max-client-batch-size` of the embedding servers
    #[clap(default_value = "32", long, env)]
    max_client_batch_size: usize,

    /// Name of the server-side prompt applied to queries
    #[clap(long, env)]
    query_prompt_name: Option<String>,

    /// Name of the server-side prompt applied to documents
    #[clap(long, env)]
    passage_prompt_name: Option<String>,

    /// Output file. Results go to stdout if not set.
    #[clap(long, short, env)]
    output: Option<PathBuf>,

    #[clap(default_value = "json", long, env, value_enum)]
    output_format: OutputFormat,

    /// Run name written in the last column of TREC output
    #[clap(default_value = "dense-search", long, env)]
    run_name: String,

    /// Outputs the logs in JSON format (useful for telemetry)
    #[clap(long, env)]
    json_output: bool,

    // Whether or not to include the log trace through spans
    #[clap(long, env)]
    disable_spans: bool,

    /// The Prometheus port to listen on. Metrics are not exported if not set.
    #[clap(long, env)]
    prometheus_port: Option<u16>,
}


#[tokio::main]
async fn main() -> Result<()> {
    // Pattern match configuration
    let args: Args = Args::parse();

    // Initialize logging
    dense_search_router::init_logging(args.json_output, args.disable_spans);

    tracing::info!("{args:?}");

    dense_search_router::run(
        args.corpus,
        args.queries,
        args.endpoints,
        args.top_k,
        args.score_function,
        args.batch_size,
        args.corpus_chunk_size,
        !args.no_sort_corpus,
        args.allow_partial,
        args.max_client_batch_size,
        args.query_prompt_name,
        args.passage_prompt_name,
        args.output,
        args.output_format,
        args.run_name,
        args.prometheus_port,
    )
    .await
}
