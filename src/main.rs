use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use futures::future::join_all;
use structopt::StructOpt;
use tokentrie::{Aggregate, Backend, SchedParams, Scheduler, Trie};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::Format;

mod input;

#[derive(Debug, StructOpt)]
#[structopt(name = "prefixmass")]
struct Opts {
    /// json array of tokens in id order (strings or byte arrays)
    #[structopt(short = "v", long = "vocab", name = "vocab")]
    vocab_path: PathBuf,

    /// json array of distributions over the vocabulary
    #[structopt(short = "d", long = "dist", name = "dist")]
    dist_path: PathBuf,

    /// sequential | parallel[:cpu|:cuda:N|:metal:N]
    #[structopt(short = "b", long = "backend", default_value = "sequential")]
    backend: Backend,

    /// only report these prefixes (repeatable)
    #[structopt(short = "p", long = "prefix", name = "prefix")]
    prefixes: Vec<String>,

    /// submit every distribution as a concurrent request to the batching scheduler
    #[structopt(long = "batched")]
    batched: bool,

    /// max requests per scheduler batch
    #[structopt(long = "max-batch", default_value = "64")]
    max_batch: usize,

    /// ms the scheduler waits for more requests before dispatching
    #[structopt(long = "linger-ms", default_value = "0")]
    linger_ms: u64,
}

fn main() -> Result<(), input::Error> {
    let fmt = Format::default()
        .compact()
        .with_line_number(false)
        .with_source_location(false);

    tracing_subscriber::fmt()
        .event_format(fmt)
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let o = Opts::from_clap(
        &Opts::clap()
            .help_message("print help information")
            .version_message("print version information")
            .get_matches(),
    );

    let vocab = input::load_vocab(&o.vocab_path)?;
    let batch = input::load_dists(&o.dist_path)?;

    let trie = Arc::new(Trie::build(&vocab)?);
    let agg = o.backend.aggregator(trie.clone())?;

    info!(
        vocab = trie.vocab_size(),
        nodes = trie.node_count(),
        batch = batch.len(),
        backend = ?o.backend,
        "aggregating"
    );

    let masses = if o.batched {
        let params = SchedParams::default()
            .max_batch(o.max_batch)
            .linger(Duration::from_millis(o.linger_ms));

        let sched = Scheduler::new(agg, params);
        let reqs = batch.into_iter().map(|p| sched.mass_sum(p));

        let out = block_on(join_all(reqs));
        out.into_iter().collect::<Result<Vec<_>, _>>()?
    } else {
        agg.batch_mass_sum(&batch)?
    };

    let prefixes: Vec<&[u8]> = o.prefixes.iter().map(|p| p.as_bytes()).collect();

    input::report(io::stdout().lock(), &trie, &masses, &prefixes)
}
